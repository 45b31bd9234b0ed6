use crate::vault::storage::SearchHit;

const DEFAULT_TEMPLATE: &str =
    "Based on the following context, please answer the question:\n\nContext:\n{context}\n\nQuestion: {query}\n\nAnswer:";

/// Renders retrieval-augmented prompts within a token budget.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    template: String,
    token_budget: usize,
}

impl ContextBuilder {
    pub fn new(token_budget: usize) -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            token_budget,
        }
    }

    /// `template` must contain `{context}` and `{query}`.
    pub fn with_template(mut self, template: &str) -> Self {
        self.template = template.to_string();
        self
    }

    /// Half of the model's context goes to the prompt, the rest stays free
    /// for history and the answer.
    pub fn for_context_length(context_length: usize) -> Self {
        Self::new(context_length / 2)
    }

    fn render(&self, query: &str, sources: &[String]) -> String {
        self.template
            .replace("{context}", &sources.join("\n\n"))
            .replace("{query}", query)
    }

    /// Adds hits in rank order while the rendered prompt stays within the
    /// budget as measured by `count_tokens`. Without any hit that fits the
    /// query is returned unchanged.
    pub fn build<F>(&self, query: &str, hits: &[SearchHit], count_tokens: F) -> String
    where
        F: Fn(&str) -> usize,
    {
        let mut sources = Vec::new();
        for hit in hits {
            sources.push(format!("[{}]\n{}", hit.source_path, hit.text.trim()));
            if count_tokens(&self.render(query, &sources)) > self.token_budget {
                sources.pop();
                break;
            }
        }

        if sources.is_empty() {
            query.to_string()
        } else {
            self.render(query, &sources)
        }
    }
}
