use comprobante_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Branch {
    pub name: String,
    pub province: String,
}

fn main() {
    assert!(Branch::new("Central".into(), "San José".into()).is_ok());
    assert_eq!(
        Branch::new("Central".into(), "  ".into()).err().as_deref(),
        Some("province must be non-empty")
    );
}
