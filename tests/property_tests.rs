use note_vault::vault::chunker::chunk_text;
use proptest::prelude::*;

fn non_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

proptest! {
    #[test]
    fn test_chunks_respect_size_limit(text in "[a-zé \n\t]{0,400}", size in 1usize..80) {
        for chunk in chunk_text(&text, size) {
            prop_assert!(chunk.text.chars().count() <= size);
            prop_assert!(!chunk.text.trim().is_empty());
        }
    }

    #[test]
    fn test_chunks_keep_all_content_in_order(text in "[a-zé \n\t]{0,400}", size in 1usize..80) {
        let joined: String = chunk_text(&text, size).iter().map(|c| non_whitespace(&c.text)).collect();
        prop_assert_eq!(joined, non_whitespace(&text));
    }

    #[test]
    fn test_chunk_offsets_point_into_source(text in "[a-z \n]{0,300}", size in 1usize..60) {
        let chunks = chunk_text(&text, size);
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert_eq!(chunk.index, i);
            let first_piece = chunk.text.split("\n\n").next().unwrap_or("");
            prop_assert!(text[chunk.start..].starts_with(first_piece));
        }
        prop_assert!(chunks.windows(2).all(|w| w[0].start < w[1].start));
    }

    #[test]
    fn test_chunking_is_deterministic(text in ".{0,200}", size in 1usize..50) {
        prop_assert_eq!(chunk_text(&text, size), chunk_text(&text, size));
    }
}
