//! Utilities module for logging and error handling
//!
//! This module provides:
//! - Structured logging with tracing
//! - The pipeline error taxonomy

pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use error::{CloudSegError, Result};
pub use logging::init_logging;

/// Format a millisecond duration for terminal output
pub fn format_millis(ms: f64) -> String {
    if ms < 1000.0 {
        format!("{:.1}ms", ms)
    } else {
        format!("{:.2}s", ms / 1000.0)
    }
}

/// Format a number with thousands separator
pub fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}
