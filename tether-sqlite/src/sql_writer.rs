use tether_core::SqlWriter;

#[derive(Debug, Default)]
pub struct SqliteSqlWriter {}

impl SqlWriter for SqliteSqlWriter {
    /// Takes the database write lock at begin.
    fn write_transaction_begin(&self, out: &mut String) {
        out.push_str("BEGIN IMMEDIATE;");
    }
}
