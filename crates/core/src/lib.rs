pub mod capability;
pub mod config;
pub mod filter;
pub mod record;
pub mod validation;

pub use capability::{
  ChunkSplitter, Clock, FixedClock, FixedSplitter, IdGenerator, SentenceSplitter, SequentialIdGenerator, SystemClock,
  UuidGenerator,
};
pub use config::{Config, DatasetConfig, SearchConfig, SecurityConfig, ServerConfig, TransferConfig, Transport};
pub use filter::{Filter, FilterBuilder, FilterError, escape_value};
pub use record::{
  DATE_FORMAT, KNOWN_FIELDS, Record, RecordType, Relationship, RelationshipType, Status, custom_metadata_from_json,
  parse_date,
};
pub use validation::{
  ValidationError, ValidationResult, optional_bool, optional_enum, optional_string, optional_string_array,
  optional_usize, require_array, require_enum, require_f32_vec, require_string,
};
