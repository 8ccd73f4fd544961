use thiserror::Error;

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";

/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// An error that can occur when validating subjects.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    /// The subject is empty or has an empty token.
    #[error("invalid subject '{0}' - must be non-empty dot-separated tokens")]
    Malformed(String),

    /// Wildcards are only allowed when subscribing.
    #[error("invalid subject '{0}' - cannot publish to a wildcard subject")]
    Wildcard(String),

    /// `>` may only appear as the final token.
    #[error("invalid subject '{0}' - '>' must be the last token")]
    MisplacedTail(String),
}

fn validate_tokens(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty()
        || subject
            .split('.')
            .any(|token| token.is_empty() || token.contains(char::is_whitespace))
    {
        return Err(SubjectError::Malformed(subject.to_string()));
    }

    Ok(())
}

/// Validates a subject that will be published to.
///
/// # Errors
/// Returns an error if the subject is malformed or contains wildcards.
pub fn validate_publish_subject(subject: &str) -> Result<(), SubjectError> {
    validate_tokens(subject)?;

    if subject
        .split('.')
        .any(|token| token == WILDCARD_ONE || token == WILDCARD_TAIL)
    {
        return Err(SubjectError::Wildcard(subject.to_string()));
    }

    Ok(())
}

/// Validates a subject that will be subscribed to.
///
/// # Errors
/// Returns an error if the subject is malformed or `>` is not the final token.
pub fn validate_subscribe_subject(subject: &str) -> Result<(), SubjectError> {
    validate_tokens(subject)?;

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token == WILDCARD_TAIL && tokens.peek().is_some() {
            return Err(SubjectError::MisplacedTail(subject.to_string()));
        }
    }

    Ok(())
}

/// Checks whether a concrete subject matches a (possibly wildcard) pattern.
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(WILDCARD_TAIL), Some(_)) | (None, None) => return true,
            (Some(WILDCARD_ONE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}
