use std::fmt;

use serde::{Serialize, Serializer};

/// Machine-readable error codes carried by run reports. Serialized as the
/// stable `E####` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    SourceMissing,
    SourceUnreadable,
    MappingUnreadable,
    SchemaDrift,
    CorruptPartition,
    CorruptCounterTable,
    PartitionWriteFailed,
    AtomicWriteFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::SourceMissing => "E2001",
            Self::SourceUnreadable => "E2002",
            Self::MappingUnreadable => "E2003",
            Self::SchemaDrift => "E3001",
            Self::CorruptPartition => "E3002",
            Self::CorruptCounterTable => "E3003",
            Self::PartitionWriteFailed => "E5001",
            Self::AtomicWriteFailed => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::SourceMissing => "No raw source files found",
            Self::SourceUnreadable => "Raw source file unreadable",
            Self::MappingUnreadable => "Code mapping table unreadable",
            Self::SchemaDrift => "Stored columns differ from the schema registry",
            Self::CorruptPartition => "Corrupt partition file",
            Self::CorruptCounterTable => "Corrupt counter table",
            Self::PartitionWriteFailed => "Partition write failed",
            Self::AtomicWriteFailed => "Atomic write failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in subtally.toml and retry."),
            Self::SourceMissing => Some("Check [paths] and [sources] prefixes in subtally.toml."),
            Self::SourceUnreadable => Some("Re-export the file; other files of the kind were still read."),
            Self::MappingUnreadable => Some("Regenerate MASTERCPC.csv from the reference workbook."),
            Self::SchemaDrift => Some("Run `subtally ingest --archive` to rewrite the affected kind."),
            Self::CorruptPartition => {
                Some("Delete the partition directory and re-run `subtally backfill`.")
            }
            Self::CorruptCounterTable => {
                Some("Delete counters_code.stx and run `subtally counters --backfill`.")
            }
            Self::PartitionWriteFailed | Self::AtomicWriteFailed => {
                Some("Check disk space and write permissions.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }

    /// Best-effort classification of an `anyhow` error chain.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<crate::store::StoreError>() {
                return e.code();
            }
            if let Some(e) = cause.downcast_ref::<crate::source::SourceError>() {
                return e.code();
            }
            if let Some(e) = cause.downcast_ref::<crate::mapping::MappingError>() {
                return e.code();
            }
            if let Some(e) = cause.downcast_ref::<crate::counters::CounterError>() {
                return e.code();
            }
            if cause.downcast_ref::<crate::atomic::AtomicWriteError>().is_some() {
                return Self::AtomicWriteFailed;
            }
        }
        Self::InternalUnexpected
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 10] = [
        ErrorCode::ConfigParseError,
        ErrorCode::SourceMissing,
        ErrorCode::SourceUnreadable,
        ErrorCode::MappingUnreadable,
        ErrorCode::SchemaDrift,
        ErrorCode::CorruptPartition,
        ErrorCode::CorruptCounterTable,
        ErrorCode::PartitionWriteFailed,
        ErrorCode::AtomicWriteFailed,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let s = code.code();
            assert_eq!(s.len(), 5);
            assert!(s.starts_with('E'));
            assert!(s.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn unknown_errors_classify_as_internal() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(ErrorCode::classify(&err), ErrorCode::InternalUnexpected);
    }
}
