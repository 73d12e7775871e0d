//! `#[derive(Model)]` as seen by maps.

use std::sync::Arc;

use datamap::prelude::*;
use datamap::SchemaColumn;
use datamap_memory::{MemoryLink, TableDef};

#[derive(Debug, Default, Model)]
struct ShippingAddress {
    id: Option<i64>,
    #[datamap(rename = "street_line")]
    street: String,
    city: Option<String>,
    #[datamap(skip)]
    cached_label: String,
}

#[test]
fn derived_members() {
    assert_eq!(ShippingAddress::TABLE_NAME, "shipping_address");
    assert_eq!(ShippingAddress::fields(), &["id", "street_line", "city"]);

    let mut address = ShippingAddress::default();
    assert!(address.set_field("street_line", &Value::from("Main St")).unwrap());
    assert!(address.set_field("city", &Value::Null).unwrap());
    assert!(!address.set_field("cached_label", &Value::from("x")).unwrap());
    assert_eq!(address.street, "Main St");
    assert_eq!(address.get_field("city"), Some(Value::Null));
    assert_eq!(address.get_field("street"), None);

    let err = address.set_field("id", &Value::from("seven")).unwrap_err();
    assert!(matches!(err, Error::Conversion { .. }));
}

#[test]
fn weak_map_binds_derived_members() {
    let link = MemoryLink::new();
    link.create_table(
        TableDef::new("shipping_address")
            .auto_increment("ID")
            .column(SchemaColumn::new("Street_Line"))
            .column(SchemaColumn::new("city").nullable()),
    )
    .unwrap();
    link.seed("shipping_address", &[("Street_Line", "Main St".into())])
        .unwrap();
    let repository = DataRepository::new(Arc::new(link));
    let addresses = repository.map::<ShippingAddress>().unwrap();

    let found = addresses.query(None).unwrap();
    assert_eq!(found.len(), 1);
    let address = found[0].read();
    assert_eq!(address.id, Some(1));
    assert_eq!(address.street, "Main St");
    assert_eq!(address.city, None);
    assert!(address.cached_label.is_empty());
}
