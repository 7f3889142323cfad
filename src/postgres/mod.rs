pub mod connection;
pub mod decoder;
pub mod source;
pub mod target;


pub use connection::PgDataSource;
pub use decoder::{ColumnInfo, DecodedMessage, PgOutputDecoder, RelationInfo};
pub use source::PostgresSource;
pub use target::PostgresTarget;
