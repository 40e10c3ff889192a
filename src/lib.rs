pub use command::{AsyncCommand, Command, Event, Response, TransportCommand};
pub use error::{codes, ExtendedError, TransportError};
pub use handler::{handle_command, listen_handler, CommandHandler, HandlerError};
pub use local::LocalTransport;
pub use options::{CommandOptions, WaitDelay, DEFAULT_TIMEOUT};
pub use transport::{CommandReceiver, EventReceiver, Transport, TransportExt, TransportLogType};

pub mod command;
pub mod error;
pub mod handler;
pub mod local;
pub mod options;
pub mod pending;
pub mod request;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "fabric")]
pub mod crypto;
#[cfg(feature = "fabric")]
pub mod fabric;
