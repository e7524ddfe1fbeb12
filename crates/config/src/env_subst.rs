use std::sync::LazyLock;

use regex::{Captures, Regex};

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Replace `${ENV_VAR}` placeholders in raw config text.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn lookup(name: &str) -> Option<String> {
        match name {
            "ROOST_HOME" => Some("/home/me".to_string()),
            "EDITOR_NAME" => Some("Cursor".to_string()),
            _ => None,
        }
    }

    #[rstest]
    #[case("path = \"${ROOST_HOME}/reg.toml\"", "path = \"/home/me/reg.toml\"")]
    #[case("${ROOST_HOME}:${EDITOR_NAME}", "/home/me:Cursor")]
    #[case("${ROOST_MISSING_XYZ}", "${ROOST_MISSING_XYZ}")]
    #[case("${not closed", "${not closed")]
    #[case("${}", "${}")]
    #[case("plain text", "plain text")]
    fn substitutes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
