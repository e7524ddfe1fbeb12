//! Transient status prefixes on display names (`Moving: app`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusPrefix {
    Moving,
    Grouping,
    Ungrouping,
    Copying,
    Importing,
}

impl StatusPrefix {
    pub const ALL: &'static [StatusPrefix] = &[
        Self::Moving,
        Self::Grouping,
        Self::Ungrouping,
        Self::Copying,
        Self::Importing,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Moving => "Moving",
            Self::Grouping => "Grouping",
            Self::Ungrouping => "Ungrouping",
            Self::Copying => "Copying",
            Self::Importing => "Importing",
        }
    }
}

impl std::fmt::Display for StatusPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Wrap a name with a status prefix. An existing prefix is replaced.
pub fn tag(prefix: StatusPrefix, name: &str) -> String {
    format!("{}: {}", prefix.label(), untag(name))
}

/// Strip every leading status prefix. Plain names come back unchanged.
pub fn untag(name: &str) -> &str {
    let mut rest = name;
    while let Some(stripped) = strip_one(rest) {
        rest = stripped;
    }
    rest
}

/// The outermost prefix on `name`, if any.
pub fn prefix_of(name: &str) -> Option<StatusPrefix> {
    StatusPrefix::ALL
        .iter()
        .copied()
        .find(|p| strip_label(name, *p).is_some())
}

pub fn is_tagged(name: &str) -> bool {
    prefix_of(name).is_some()
}

fn strip_one(name: &str) -> Option<&str> {
    StatusPrefix::ALL
        .iter()
        .find_map(|p| strip_label(name, *p))
}

fn strip_label(name: &str, prefix: StatusPrefix) -> Option<&str> {
    name.strip_prefix(prefix.label())?.strip_prefix(": ")
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(StatusPrefix::Moving, "app", "Moving: app")]
    #[case(StatusPrefix::Copying, "app-2", "Copying: app-2")]
    #[case(StatusPrefix::Grouping, "Importing: app", "Grouping: app")]
    fn tags(#[case] prefix: StatusPrefix, #[case] name: &str, #[case] expected: &str) {
        assert_eq!(tag(prefix, name), expected);
        assert_eq!(untag(&tag(prefix, name)), untag(name));
    }

    #[rstest]
    #[case("app", "app")]
    #[case("Moving: app", "app")]
    #[case("Ungrouping: Moving: app", "app")]
    #[case("Moving:app", "Moving:app")]
    #[case("Renaming: app", "Renaming: app")]
    #[case("", "")]
    fn untags(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(untag(name), expected);
        assert_eq!(untag(untag(name)), untag(name));
    }

    #[test]
    fn prefix_detection() {
        assert_eq!(prefix_of("Ungrouping: x"), Some(StatusPrefix::Ungrouping));
        assert_eq!(prefix_of("x"), None);
        assert!(is_tagged("Importing: x"));
        assert!(!is_tagged("Importing x"));
    }
}
