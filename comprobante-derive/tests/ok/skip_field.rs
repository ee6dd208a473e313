use comprobante_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Tenant {
    pub name: String,
    #[validate(skip)]
    pub sequence: u64,
}

fn main() {
    let tenant = Tenant::new("Comercial Arenal".into(), 0).expect("valid");
    assert_eq!(tenant.sequence, 0);
}
