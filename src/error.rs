use thiserror::Error;

/// Errors produced by the prescription pipeline.
///
/// Only `SchemaViolation` and `UnknownSession` abort a whole request.
/// Lookup misses and timeouts are per-item outcomes: callers degrade the
/// affected medication or pair and carry on with the rest of the batch.
#[derive(Error, Debug)]
pub enum Error {
    /// The raw field mapping does not satisfy the prescription schema.
    #[error("schema violation in field '{field}': {reason}")]
    SchemaViolation { field: String, reason: String },

    /// An external source returned no result for the query.
    #[error("external lookup miss for '{query}' against {source_name}")]
    ExternalLookupMiss {
        source_name: &'static str,
        query: String,
    },

    /// An external call exceeded its deadline, including the single retry.
    #[error("external lookup timed out against {source_name}")]
    ExternalLookupTimeout { source_name: &'static str },

    /// No stored context exists for the given session identifier.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A model collaborator returned a category outside the allowed
    /// vocabulary. Never coerced to a default; surfaced per claim/pair.
    #[error("model returned out-of-vocabulary classification: {raw}")]
    ClassificationOutOfVocabulary { raw: String },

    /// Transport-level failure talking to an external source.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The language-model collaborator itself failed.
    #[error("model error: {0}")]
    Model(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SchemaViolation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_name_their_source_in_display() {
        let miss = Error::ExternalLookupMiss {
            source_name: "rxnorm",
            query: "denosumab".to_string(),
        };
        assert_eq!(
            miss.to_string(),
            "external lookup miss for 'denosumab' against rxnorm"
        );

        let timeout = Error::ExternalLookupTimeout {
            source_name: "dailymed",
        };
        assert_eq!(timeout.to_string(), "external lookup timed out against dailymed");
        // The source name is payload, not an underlying cause.
        assert!(std::error::Error::source(&timeout).is_none());
    }
}
