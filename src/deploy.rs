//! Deployment errors and their aggregation.
//!
//! Setup code threads an [`ErrorCollector`] through every step, recording each independent
//! failure, and converts it into a single [`DeploymentError`] at the end.
use std::{error::Error as StdError, fmt};

use crate::WebSocketError;

/// A configuration or binding failure at connect or deploy time.
///
/// It carries a summary message and, optionally, the failures that caused it.
#[derive(Debug)]
pub struct DeploymentError {
    message: String,
    causes: Vec<WebSocketError>,
}

impl DeploymentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// A failure with a single underlying cause.
    pub fn with_cause(message: impl Into<String>, cause: impl Into<WebSocketError>) -> Self {
        Self {
            message: message.into(),
            causes: vec![cause.into()],
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[WebSocketError] {
        &self.causes
    }
}

impl fmt::Display for DeploymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

impl StdError for DeploymentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.causes
            .first()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Ordered list of failures found while setting something up.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<WebSocketError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, error: impl Into<WebSocketError>) {
        self.errors.push(error.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` if nothing was collected, otherwise one error aggregating everything that was.
    pub fn compose(self, message: impl Into<String>) -> Result<(), DeploymentError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DeploymentError {
                message: message.into(),
                causes: self.errors,
            })
        }
    }
}
