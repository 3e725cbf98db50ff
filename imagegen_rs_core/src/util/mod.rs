mod auto_dtype;
mod encoding;
mod tokens;

pub use auto_dtype::{ModelDType, TryIntoDType};
pub use encoding::{encode_base64, encode_png, PNG_SIGNATURE};
pub(crate) use tokens::pad_tokens;
