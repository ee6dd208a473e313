use comprobante_derive::Validate;

#[derive(Debug, PartialEq)]
pub struct InputError(String);

impl From<String> for InputError {
    fn from(message: String) -> Self {
        InputError(message)
    }
}

#[derive(Validate)]
#[validate_error(InputError)]
pub struct Office {
    #[validate(non_empty)]
    pub tenant: String,
    #[validate(digits, len = 3)]
    pub code: String,
}

fn main() {
    let err = Office::new("t-1".into(), "1".into()).err();
    assert_eq!(
        err,
        Some(InputError("code must be exactly 3 characters, got 1".into()))
    );
}
