// Postgres implementation of ObjectStore. Rows are mapped to domain types in
// `rows`; the SQL lives in `postgres`.

mod postgres;
mod rows;

pub use postgres::PgObjectStore;
