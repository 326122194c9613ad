use std::net::Ipv4Addr;

use thiserror::Error;

/// chv error types
#[derive(Error, Debug)]
pub enum ChvError {
    /// Subnet CIDR could not be parsed or has no room for guests
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    /// Every usable address in the subnet is allocated
    #[error("No available IPs in subnet {subnet}")]
    PoolExhausted { subnet: String },

    /// Address does not belong to the allocator's subnet
    #[error("IP {address} is not in the subnet {subnet}")]
    AddressOutOfRange { address: Ipv4Addr, subnet: String },

    /// Address is inside the subnet but not currently allocated
    #[error("IP {0} is not allocated")]
    AddressNotAllocated(Ipv4Addr),

    /// A live VM with this name already exists
    #[error("VM '{0}' already exists")]
    DuplicateName(String),

    /// No VM with this name
    #[error("VM '{0}' not found")]
    NotFound(String),

    /// Operation not permitted in the VM's current state
    #[error("Cannot {operation} VM '{name}' in state {state}")]
    InvalidState {
        name: String,
        state: String,
        operation: &'static str,
    },

    /// The hypervisor process or its API reported a failure
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    /// A bounded wait on an external call expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Required key missing from the kernel command line
    #[error("Missing boot parameter: {0}")]
    MissingBootParameter(String),

    /// Host or guest network configuration failed
    #[error("Network setup failed: {0}")]
    NetworkSetup(String),

    /// Guest stateful disk mount failed
    #[error("Mount failed: {0}")]
    Mount(String),

    /// Guest user creation failed
    #[error("User provisioning failed: {0}")]
    UserProvisioning(String),

    /// Non-success HTTP response from the chv server, body kept verbatim
    #[error("error: {body} code: {status}")]
    Api { status: u16, body: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ChvError {
    fn from(err: serde_json::Error) -> Self {
        ChvError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ChvError {
    fn from(err: serde_yaml::Error) -> Self {
        ChvError::Serialization(err.to_string())
    }
}

/// Result type alias for chv operations
pub type Result<T> = std::result::Result<T, ChvError>;
