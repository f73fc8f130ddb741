// Wire-protocol codec: framing, message builders and socket helpers.

// Standard library imports
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

// External crate imports
use once_cell::sync::Lazy;

// Declare submodules
pub mod config_socket;
pub mod error;
pub mod protocol;
pub mod socket;
pub mod types;

// Re-export public items
pub use config_socket::configure_tcp_socket;
pub use error::PgErrorMsg;
pub use protocol::{
    auth_ok, backend_key_data, bind_message, cancel_request, command_complete, data_row,
    error_message, error_response, error_response_terminal, execute_message, flush, md5_challenge,
    md5_first_pass, md5_hash_password, md5_hash_second_pass, md5_password, parse_message,
    parse_params, parse_startup, password_message, read_password, ready_for_query,
    row_description, sasl_initial_response, scram_server_response, scram_start_challenge,
    send_login_ok, server_parameter_message, simple_query, ssl_request, startup, sync, terminate,
    wrong_password, TransactionStatus,
};
pub use socket::{
    proxy_copy_data, proxy_copy_data_with_timeout, read_message, read_message_data,
    read_message_header, write_all_flush, write_all_half,
};
pub use types::{read_data_row, vec_to_string, BytesMutReader, DataType};

// Constants
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

// Global state
pub static CURRENT_MEMORY: Lazy<Arc<AtomicI64>> = Lazy::new(|| Arc::new(AtomicI64::new(0)));

// Tests
#[cfg(test)]
pub(crate) mod tests;
