pub mod enricher;
pub mod transcript;
pub mod youtube;

pub use enricher::OpenAiEnricher;
pub use transcript::YouTubeTranscripts;
pub use youtube::YouTubeLister;

use vibes_core::error::AppError;

/// Map a reqwest transport failure (no HTTP status) to the error taxonomy.
pub(crate) fn transport_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::TransientCall(e.to_string())
    }
}
