pub mod chat;
pub mod clock;
pub mod error;
pub mod mode;
pub mod utils;

pub use chat::{CacheLayer, ChatContext, ChatRequest, ChatResponse, STABLE_CONTEXT_KEYS};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{
    BackendFailure, ErrorCategory, ErrorClassifier, Result, ResultExt, RouterError,
};
pub use mode::{Confidence, Mode, ModeDecision};
pub use utils::{day_key, log_filter_warn, month_key, normalize_text};
