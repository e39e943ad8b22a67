pub fn pluralize(count: usize, singular: &str, plural: Option<&str>) -> String {
    if count == 1 {
        return singular.to_string();
    }

    match plural {
        Some(p) => p.to_string(),
        None => format!("{singular}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_and_irregular_plurals() {
        assert_eq!(pluralize(1, "file", None), "file");
        assert_eq!(pluralize(0, "file", None), "files");
        assert_eq!(pluralize(3, "chunk", Some("chunks")), "chunks");
    }
}
