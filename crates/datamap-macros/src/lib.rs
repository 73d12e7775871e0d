//! Procedural macros for DataMap Rust.
//!
//! - `#[derive(Model)]` implements `datamap_core::Model` for a struct with
//!   named fields, exposing each field as a member that maps can bind to by
//!   name.
//!
//! ```ignore
//! #[derive(Debug, Default, Model)]
//! #[datamap(table = "orders")]
//! struct Order {
//!     id: Option<i64>,
//!     #[datamap(rename = "notes")]
//!     note: String,
//!     #[datamap(skip)]
//!     lines: Vec<Entity<OrderLine>>,
//! }
//! ```

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod model_derive;

/// Derive `datamap_core::Model`.
///
/// Struct attributes:
/// - `#[datamap(table = "name")]`: table used by implicit maps (defaults to
///   the snake-cased struct name)
///
/// Field attributes:
/// - `#[datamap(rename = "name")]`: member name exposed to maps
/// - `#[datamap(skip)]`: not a member (references, caches)
#[proc_macro_derive(Model, attributes(datamap))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match model_derive::parse_model(&input) {
        Ok(def) => model_derive::generate_model_impl(&def).into(),
        Err(e) => e.to_compile_error().into(),
    }
}
