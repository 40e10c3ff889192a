use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use command_transport::amqp::{AmqpSettings, AmqpTransport, ConnectionState};
use command_transport::{
    codes, listen_handler, AsyncCommand, Command, CommandHandler, CommandOptions, Event, ExtendedError, HandlerError,
    Transport, TransportCommand, TransportError,
};

/// Broker coordinates from `RABBIT_HOST`, `RABBIT_USER` and `RABBIT_PASSWORD`. Tests are skipped
/// when no broker is configured.
fn settings() -> Option<AmqpSettings> {
    let host: String = std::env::var("RABBIT_HOST").ok()?;
    Some(
        AmqpSettings::builder()
            .host(host)
            .username(std::env::var("RABBIT_USER").unwrap_or_else(|_| "guest".to_string()))
            .password(std::env::var("RABBIT_PASSWORD").unwrap_or_else(|_| "guest".to_string()))
            .connection_timeout(Duration::from_secs(10))
            .build(),
    )
}

fn unique(name: &str) -> String {
    format!("{}_{}", name, Uuid::new_v4().simple())
}

/// Replies according to the `reply` field of the request.
struct ReplyHandler {
    name: String,
}

#[async_trait]
impl CommandHandler for ReplyHandler {
    type Request = Value;
    type Response = Value;

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: Value, _: &TransportCommand) -> Result<Value, HandlerError> {
        match request["reply"].as_str() {
            Some("error") => Err(ExtendedError::with_code("rejected", 42).into()),
            Some("value") => Ok(json!({"ok": true})),
            _ => Ok(Value::Null),
        }
    }
}

/// Always asks to be retried later.
struct BusyHandler {
    name: String,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler for BusyHandler {
    type Request = Value;
    type Response = ();

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _: Value, _: &TransportCommand) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Wait)
    }
}

#[tokio::test]
async fn amqp_reply_channels_test() {
    let Some(settings) = settings() else { return };
    let server = Arc::new(AmqpTransport::connect(settings.clone()).await.unwrap());
    let client = AmqpTransport::connect(settings).await.unwrap();

    let name: String = unique("Reply");
    listen_handler(server.clone(), Arc::new(ReplyHandler { name: name.clone() }))
        .await
        .unwrap();

    let send = |reply: &str| {
        let command = AsyncCommand::new(name.as_str(), json!({ "reply": reply }));
        client.send_listen(command, CommandOptions::default())
    };

    assert_eq!(send("value").await, Ok(Some(json!({"ok": true}))));
    assert_eq!(send("null").await, Ok(Some(Value::Null)));
    let error = send("error").await.unwrap_err();
    assert_eq!(error.code, 42);
    assert_eq!(error.message, "rejected");
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn amqp_undefined_reply_test() {
    let Some(settings) = settings() else { return };
    let server = AmqpTransport::connect(settings.clone()).await.unwrap();
    let client = Arc::new(AmqpTransport::connect(settings).await.unwrap());

    let name: String = unique("Undefined");
    let mut commands = server.listen(&name).await.unwrap();

    let sender = client.clone();
    let command_name = name.clone();
    let reply = tokio::spawn(async move {
        sender
            .send_listen(AsyncCommand::new(command_name, json!({})), CommandOptions::default())
            .await
    });

    let command = commands.recv().await.unwrap();
    server.complete(command, Ok(None)).await.unwrap();
    assert_eq!(reply.await.unwrap(), Ok(None));
}

#[tokio::test]
async fn amqp_wait_is_bounded_by_timeout_test() {
    let Some(settings) = settings() else { return };
    let server = Arc::new(AmqpTransport::connect(settings.clone()).await.unwrap());
    let client = AmqpTransport::connect(settings).await.unwrap();

    let name: String = unique("Busy");
    let calls = Arc::new(AtomicU32::new(0));
    listen_handler(
        server.clone(),
        Arc::new(BusyHandler {
            name: name.clone(),
            calls: calls.clone(),
        }),
    )
    .await
    .unwrap();

    let error = client
        .send_listen(
            AsyncCommand::new(name.as_str(), json!({})),
            CommandOptions::with_timeout(Duration::from_millis(2000)),
        )
        .await
        .unwrap_err();

    // 500ms delays fit three times into 2000ms; the fourth wait is refused.
    assert_eq!(error.code, codes::WAIT_EXCEED);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn amqp_disconnect_rejects_in_flight_test() {
    let Some(settings) = settings() else { return };
    let client = Arc::new(AmqpTransport::connect(settings).await.unwrap());
    let mut state = client.state();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    let name: String = unique("Nobody");
    let replies: Vec<_> = (0..3)
        .map(|_| {
            let sender = client.clone();
            let command = AsyncCommand::new(name.as_str(), json!({}));
            tokio::spawn(async move { sender.send_listen(command, CommandOptions::default()).await })
        })
        .collect();
    while client.in_flight() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.disconnect().await.unwrap();
    for reply in replies {
        assert_eq!(reply.await.unwrap().unwrap_err().code, codes::NO_CONNECTION);
    }
    assert_eq!(client.in_flight(), 0);
    assert_eq!(*state.borrow(), ConnectionState::Closed);
    assert!(matches!(
        client.dispatch(Event::new("Closed", None)).await,
        Err(TransportError::NoConnection(_))
    ));
}

#[tokio::test]
async fn amqp_recovers_from_closed_channel_test() {
    let Some(settings) = settings() else { return };
    let server = Arc::new(AmqpTransport::connect(settings.clone()).await.unwrap());
    let client = AmqpTransport::connect(settings.clone()).await.unwrap();

    let reply_name: String = unique("Reply");
    listen_handler(server.clone(), Arc::new(ReplyHandler { name: reply_name.clone() }))
        .await
        .unwrap();

    // Publishing to an exchange deleted behind the transport's back makes the broker close the
    // channel while the connection stays up.
    let name: String = unique("Deleted");
    server.send(Command::new(name.as_str(), json!({})), CommandOptions::default()).await.unwrap();
    let admin = lapin::Connection::connect_uri(settings.uri().unwrap(), lapin::ConnectionProperties::default())
        .await
        .unwrap();
    let admin_channel = admin.create_channel().await.unwrap();
    admin_channel
        .exchange_delete(&name, lapin::options::ExchangeDeleteOptions::default())
        .await
        .unwrap();
    admin_channel
        .queue_delete(&name, lapin::options::QueueDeleteOptions::default())
        .await
        .unwrap();
    let _ = server.send(Command::new(name.as_str(), json!({})), CommandOptions::default()).await;

    let recovered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let sent = server.send(Command::new(name.as_str(), json!({})), CommandOptions::default()).await;
            if sent.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(recovered.is_ok());
    assert_eq!(*server.state().borrow(), ConnectionState::Connected);

    let command = AsyncCommand::new(reply_name.as_str(), json!({"reply": "value"}));
    let reply = client
        .send_listen(command, CommandOptions::with_timeout(Duration::from_secs(5)))
        .await;
    assert_eq!(reply, Ok(Some(json!({"ok": true}))));

    admin.close(200, "OK").await.unwrap();
}

#[tokio::test]
async fn amqp_events_test() {
    let Some(settings) = settings() else { return };
    let publisher = AmqpTransport::connect(settings.clone()).await.unwrap();
    let subscriber = AmqpTransport::connect(settings).await.unwrap();

    let name: String = unique("Changed");
    let mut events = subscriber.get_dispatcher(&name).await.unwrap();
    publisher
        .dispatch(Event::new(name.as_str(), Some(json!({"id": 1}))))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, name);
    assert_eq!(event.data, Some(json!({"id": 1})));
}

#[tokio::test]
async fn amqp_null_request_rejected_test() {
    let Some(settings) = settings() else { return };
    let client = AmqpTransport::connect(settings).await.unwrap();

    let result = client
        .send(Command::new("Anything", Value::Null), CommandOptions::default())
        .await;
    assert!(matches!(result, Err(TransportError::EmptyRequest(_))));
}
