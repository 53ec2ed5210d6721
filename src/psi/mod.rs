pub mod generator;
pub mod parser;
pub mod pat;
pub mod pmt;
pub mod section;

pub use generator::PatPmtGenerator;
pub use parser::PatPmtParser;
pub use pat::{parse_pat, PatSection};
pub use pmt::{parse_pmt, PmtSection};
pub use section::SectionReader;
