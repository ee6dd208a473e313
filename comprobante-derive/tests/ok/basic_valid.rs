use comprobante_derive::Validate;

#[derive(Validate)]
pub struct Terminal {
    pub label: String,
    #[validate(digits, len = 5)]
    pub code: String,
}

fn main() {
    let ok = Terminal::new("caja principal".into(), "00001".into());
    assert!(ok.is_ok());

    let short = Terminal::new("caja".into(), "001".into());
    assert_eq!(
        short.err().as_deref(),
        Some("code must be exactly 5 characters, got 3")
    );

    let letters = Terminal::new("caja".into(), "0000A".into());
    assert_eq!(letters.err().as_deref(), Some("code must contain only digits"));
}
