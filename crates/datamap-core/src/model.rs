//! The member surface a mapped type exposes.
//!
//! Maps bind columns to members either through explicit accessor closures or
//! through the names listed here. Implementations are usually generated with
//! `#[derive(Model)]`, but writing one by hand is straightforward.

use crate::error::Result;
use crate::value::Value;

/// A plain domain type that can be bound to a table.
pub trait Model: Default + Send + Sync + 'static {
    /// Table used when no explicit map names one.
    const TABLE_NAME: &'static str;

    /// Names of the members reachable through [`Model::get_field`] and
    /// [`Model::set_field`].
    fn fields() -> &'static [&'static str];

    /// Read a member by name, `None` when no such member exists.
    fn get_field(&self, name: &str) -> Option<Value>;

    /// Assign a member by name. Returns `Ok(false)` when no such member
    /// exists and an error when the value cannot be converted.
    fn set_field(&mut self, name: &str, value: &Value) -> Result<bool>;
}
