//! Writer configuration
//!
//! Consolidates the knobs accepted by [`create_writer`](crate::create_writer)
//! into a single configuration structure with sensible defaults and presets.

/// Configuration for a writer bridge
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Whether the sink starts out accepting deliveries.
    ///
    /// When `false`, producers suspend on their first write until the sink
    /// owner calls `set_writability(true)`.
    pub initially_writable: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            initially_writable: true, // most transports start with capacity
        }
    }
}

impl WriterConfig {
    /// Create a config whose sink starts out writable
    pub fn writable() -> Self {
        Self {
            initially_writable: true,
        }
    }

    /// Create a config whose sink starts out applying back-pressure
    pub fn paused() -> Self {
        Self {
            initially_writable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_writable() {
        assert!(WriterConfig::default().initially_writable);
        assert!(WriterConfig::writable().initially_writable);
        assert!(!WriterConfig::paused().initially_writable);
    }
}
