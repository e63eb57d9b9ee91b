pub mod cli_credential;
pub mod credential;
pub mod device_code;
pub mod managed_identity;
pub mod resolver;
pub mod service_principal;
pub mod token_cache;
pub mod token_manager;
pub mod types;

pub use cli_credential::{AzureCliCredential, PowerShellCredential};
pub use credential::{
    DeviceCodePrompt, TokenCredential, log_device_code_prompt, resource_from_scopes,
};
pub use device_code::DeviceCodeCredential;
pub use managed_identity::ManagedIdentityCredential;
pub use resolver::CredentialResolver;
pub use service_principal::{ClientCertificateCredential, ClientSecretCredential};
pub use token_cache::{
    InMemoryTokenStore, SharedTokenHandle, TokenSlot, TokenStore, TokenStoreCredential,
};
pub use token_manager::TokenManager;
pub use types::{
    AccessToken, CredentialDescriptor, CredentialKind, DeviceCodeInfo, IdentityInfo,
    MINIMUM_TOKEN_VALID_DURATION, SpnInfo, TOKEN_REFRESH_SOURCE_TOKEN_STORE, TokenInfo,
};
