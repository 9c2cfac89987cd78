pub mod text_encoding;
pub mod field_type;
pub mod codec;
pub mod definition;
pub mod recovery;
pub mod arrays;
pub mod header;
pub mod page;
pub mod record;
pub mod schema;
pub mod store;
pub mod writer;


pub use text_encoding::{TextEncoding, DEFAULT_ENCODING_LABEL};
pub use field_type::{FieldType, TargetType, TypedValue, hex_string};
pub use codec::{ByteCodec, ValueLayout, decode_packed_date, decode_packed_time, encode_packed_date, encode_packed_time};
pub use definition::{Field, IndexDefinition, MemoDefinition, TableDefinition};
pub use recovery::{Confidence, Definition, Resolution, resolve};
pub use arrays::{ArrayFieldInfo, ColumnSource, ColumnValue, TableAnalysis, analyze};
pub use header::FileHeader;
pub use page::{Page, PageHeader, rle_compress, rle_decompress};
pub use record::{RawRecord, Record, RecordBody};
pub use schema::{TableSchema, table_schema};
pub use store::{MemoIndex, TableRecords, TpsFile};
pub use writer::TpsWriter;
