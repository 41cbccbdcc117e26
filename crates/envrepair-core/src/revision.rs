use std::fmt;
use std::str::FromStr;

/// Which revision a rollback should land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionTarget {
    Previous,
    Latest,
    Number(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRevisionTarget(pub String);

impl fmt::Display for InvalidRevisionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid revision target '{}': expected prev, latest or a number",
            self.0
        )
    }
}

impl std::error::Error for InvalidRevisionTarget {}

impl FromStr for RevisionTarget {
    type Err = InvalidRevisionTarget;

    /// An empty target means the previous revision.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "prev" | "previous" => Ok(Self::Previous),
            "latest" | "current" => Ok(Self::Latest),
            other => other
                .parse()
                .map(Self::Number)
                .map_err(|_| InvalidRevisionTarget(trimmed.to_string())),
        }
    }
}

impl fmt::Display for RevisionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Previous => f.write_str("prev"),
            Self::Latest => f.write_str("latest"),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}
