mod model_source;
mod progress;
mod safetensors;
mod tokens;

pub use model_source::*;
pub use progress::{IterWithProgress, NiceProgressBar};
pub use safetensors::{load_safetensors, BytesSafetensors};
pub use tokens::{TokenSource, TokenSourceError};
