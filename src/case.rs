//! Identifier case conversion for generated GraphQL names.

/// snake_case -> camelCase. e.g. "customer_id" -> "customerId", "billing__invoices" -> "billingInvoices".
pub fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = false;
    for c in s.chars() {
        if c == '_' {
            capitalize_next = !out.is_empty();
        } else if capitalize_next {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// snake_case -> PascalCase. e.g. "order_items" -> "OrderItems".
pub fn to_pascal_case(s: &str) -> String {
    let camel = to_camel_case(s);
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Make an arbitrary column or table name usable as a GraphQL name:
/// characters outside `[_0-9A-Za-z]` become `_`, and a leading digit gets a `_` prefix.
pub fn graphql_safe(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
