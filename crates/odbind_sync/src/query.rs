//! Query composition from entity definitions.

use odbind_core::{DetailDefinition, EntityDefinition};
use odbind_protocol::QueryOptions;

/// `$select` and `$expand` options fetching a whole entity tree.
pub fn entity_query(definition: &EntityDefinition) -> QueryOptions {
    QueryOptions {
        select: definition.select_list(),
        expand: expand_clause(definition),
        ..QueryOptions::default()
    }
}

/// Recursive `$expand` over children and details, e.g.
/// `Lines($select=LineID,Qty;$expand=Notes),Customer($select=Name)`.
pub fn expand_clause(definition: &EntityDefinition) -> Option<String> {
    let children = definition.children.iter().map(|child| {
        let nested = if child.children.is_empty() && child.details.is_empty() {
            None
        } else {
            expand_clause(child)
        };
        expand_item(child.navigation(), child.select_list(), nested)
    });
    let details = definition.details.iter().map(detail_item);
    join(children.chain(details).collect())
}

fn detail_item(detail: &DetailDefinition) -> String {
    let nested = join(detail.details.iter().map(detail_item).collect());
    expand_item(detail.navigation(), detail.select_list(), nested)
}

fn expand_item(navigation: &str, select: Option<String>, expand: Option<String>) -> String {
    let mut subqueries = Vec::new();
    if let Some(select) = select {
        subqueries.push(format!("$select={select}"));
    }
    if let Some(expand) = expand {
        subqueries.push(format!("$expand={expand}"));
    }
    if subqueries.is_empty() {
        navigation.to_string()
    } else {
        format!("{}({})", navigation, subqueries.join(";"))
    }
}

fn join(items: Vec<String>) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        Some(items.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_definition_has_no_expand() {
        let def = EntityDefinition::new("Orders", "OrderID");
        let query = entity_query(&def);
        assert_eq!(query.select, None);
        assert_eq!(query.expand, None);
    }

    #[test]
    fn nested_expand() {
        let def = EntityDefinition::new("Orders", "OrderID")
            .with_keys(["OrderID", "Name", "Secret"])
            .with_ignored_keys(["Secret"])
            .with_child(
                EntityDefinition::new("OrderLines", "LineID")
                    .with_navigation_key("Lines")
                    .with_keys(["LineID", "Qty"])
                    .with_child(EntityDefinition::new("Notes", "NoteID"))
                    .with_detail(
                        DetailDefinition::new("Products")
                            .with_navigation_key("Product")
                            .with_keys(["Name"]),
                    ),
            )
            .with_child(EntityDefinition::new("Payments", "PaymentID"))
            .with_detail(
                DetailDefinition::new("Customers")
                    .with_navigation_key("Customer")
                    .with_keys(["Name"])
                    .with_detail(DetailDefinition::new("Address")),
            );

        let query = entity_query(&def);
        assert_eq!(query.select.as_deref(), Some("OrderID,Name"));
        assert_eq!(
            query.expand.as_deref(),
            Some(
                "Lines($select=LineID,Qty;$expand=Notes,Product($select=Name)),\
                 Payments,\
                 Customer($select=Name;$expand=Address)"
            )
        );
    }
}
