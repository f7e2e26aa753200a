/// Formats a query for log messages, cutting it at 497 bytes.
#[macro_export]
macro_rules! truncate_long {
    ($query:expr) => {{
        let query: &str = &$query;
        let mut end = ::std::cmp::min(query.len(), 497);
        while !query.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}{}",
            query[..end].trim_end(),
            if query.len() > 497 { "..." } else { "" },
        )
    }};
}
