pub mod cursor;
pub mod error;
pub mod reader;
pub mod writer;

pub use error::{LedgerError, Result};
pub use reader::LedgerReader;
pub use writer::LedgerWriter;
