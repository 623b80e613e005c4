//! Round-robin over equivalent upstream search endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::{DispatchError, Result};

/// Ordered set of equivalent search URL templates with a rotation cursor.
///
/// The cursor always stays in `[0, len)`.
#[derive(Debug)]
pub struct EndpointRotator {
    templates: Vec<String>,
    cursor: AtomicUsize,
}

impl EndpointRotator {
    /// Creates a rotator; the list must not be empty.
    pub fn new(templates: Vec<String>) -> Result<Self> {
        if templates.is_empty() {
            return Err(DispatchError::Config("endpoint list is empty".to_string()));
        }
        Ok(Self {
            templates,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the template under the cursor and advances it.
    pub fn next(&self) -> &str {
        let len = self.templates.len();
        let index = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
            .unwrap_or(0);
        debug!("Using endpoint {}/{}", index + 1, len);
        &self.templates[index]
    }

    /// Position of the next template to be returned.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Always false for a constructed rotator.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates in rotation order.
    pub fn templates(&self) -> &[String] {
        &self.templates
    }
}
