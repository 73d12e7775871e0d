//! Models, tables and maps shared by the unit tests.

use std::sync::Arc;

use datamap_core::{Model, Result, SchemaColumn, Value};
use datamap_memory::{MemoryLink, TableDef};

use crate::entity::Entity;
use crate::map::MapConfig;
use crate::repository::DataRepository;

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Customer {
    pub id: Option<i64>,
    pub name: String,
}

impl Customer {
    pub fn named(name: &str) -> Entity<Customer> {
        Entity::new(Customer {
            id: None,
            name: name.to_string(),
        })
    }
}

impl Model for Customer {
    const TABLE_NAME: &'static str = "customers";

    fn fields() -> &'static [&'static str] {
        &["id", "name"]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.clone().into()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> Result<bool> {
        match name {
            "id" => self.id = value.convert(name)?,
            "name" => self.name = value.convert(name)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Order {
    pub id: Option<i64>,
    pub customer_id: Option<i64>,
    pub note: String,
    pub customer: Option<Entity<Customer>>,
    pub lines: Vec<Entity<OrderLine>>,
}

impl Model for Order {
    const TABLE_NAME: &'static str = "orders";

    fn fields() -> &'static [&'static str] {
        &["id", "note"]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "note" => Some(self.note.clone().into()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> Result<bool> {
        match name {
            "id" => self.id = value.convert(name)?,
            "note" => self.note = value.convert(name)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct OrderLine {
    pub id: Option<i64>,
    pub order_id: Option<i64>,
    pub product: String,
    pub quantity: i64,
}

impl OrderLine {
    pub fn of(product: &str, quantity: i64) -> Entity<OrderLine> {
        Entity::new(OrderLine {
            product: product.to_string(),
            quantity,
            ..OrderLine::default()
        })
    }
}

impl Model for OrderLine {
    const TABLE_NAME: &'static str = "order_lines";

    fn fields() -> &'static [&'static str] {
        &["id", "order_id", "product", "quantity"]
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "order_id" => Some(self.order_id.into()),
            "product" => Some(self.product.clone().into()),
            "quantity" => Some(self.quantity.into()),
            _ => None,
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> Result<bool> {
        match name {
            "id" => self.id = value.convert(name)?,
            "order_id" => self.order_id = value.convert(name)?,
            "product" => self.product = value.convert(name)?,
            "quantity" => self.quantity = value.convert(name)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// A link with the `customers`, `orders` and `order_lines` tables.
pub(crate) fn link() -> Arc<MemoryLink> {
    let link = MemoryLink::new();
    link.create_table(
        TableDef::new("customers")
            .auto_increment("id")
            .column(SchemaColumn::new("name"))
            .row_version("row_version"),
    )
    .unwrap();
    link.create_table(
        TableDef::new("orders")
            .auto_increment("id")
            .column(SchemaColumn::new("customer_id").nullable())
            .column(SchemaColumn::new("note")),
    )
    .unwrap();
    link.create_table(
        TableDef::new("order_lines")
            .auto_increment("id")
            .column(SchemaColumn::new("order_id").nullable())
            .column(SchemaColumn::new("product"))
            .column(SchemaColumn::new("quantity")),
    )
    .unwrap();
    Arc::new(link)
}

/// Orders with a `customer` parent and a `lines` child collection. The
/// foreign key is read from the customer at write time.
pub(crate) fn order_config() -> MapConfig<Order> {
    MapConfig::<Order>::new()
        .column_with(
            "customer_id",
            |o: &Order| {
                o.customer
                    .as_ref()
                    .map_or(o.customer_id, |c| c.read().id)
                    .into()
            },
            |o: &mut Order, v: &Value| {
                o.customer_id = v.convert("customer_id")?;
                Ok(())
            },
        )
        .parent("customer", |o: &Order| o.customer.clone())
        .child("lines", |o: &Order| o.lines.clone())
}

/// A repository over [`link`] with the order map registered.
pub(crate) fn repository() -> (Arc<MemoryLink>, DataRepository) {
    let link = link();
    let repository = DataRepository::new(link.clone());
    repository.register(order_config()).unwrap();
    (link, repository)
}
