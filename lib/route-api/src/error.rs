use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("The {kind}SubnetNAT configuration property is not specified correctly: {rule}")]
    MalformedNatRule { kind: String, rule: String },

    #[error("Invalid original CIDR specified in {kind}SubnetNAT: {cidr}")]
    InvalidOriginalCidr { kind: String, cidr: String },

    #[error("Invalid translated CIDR specified in {kind}SubnetNAT: {cidr}")]
    InvalidMappedCidr { kind: String, cidr: String },

    #[error("The original/translated CIDR mapping in {kind}SubnetNAT must be networks of the same size: {rule}")]
    NatSizeMismatch { kind: String, rule: String },

    #[error("Record decode failed: {0}")]
    Decode(String),
}
