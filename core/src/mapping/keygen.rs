/// How generated keys reach the caller's parameter object after an insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum KeyGeneratorKind {
    #[default]
    None,
    /// Ask the driver for generated keys after execute and assign them to
    /// the statement's key properties.
    DriverGenerated,
    /// Run a companion select statement, before or after the main one.
    SelectKey { statement_id: String, before: bool },
}

impl KeyGeneratorKind {
    pub fn runs_before(&self) -> bool {
        matches!(self, KeyGeneratorKind::SelectKey { before: true, .. })
    }

    pub fn wants_driver_keys(&self) -> bool {
        matches!(self, KeyGeneratorKind::DriverGenerated)
    }
}
