use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use command_transport::{
    codes, listen_handler, AsyncCommand, Command, CommandHandler, CommandOptions, Event, ExtendedError,
    HandlerError, LocalTransport, Transport, TransportCommand, TransportExt,
};

#[derive(Deserialize)]
struct Transfer {
    amount: i64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Balance {
    balance: i64,
}

struct TransferHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandHandler for TransferHandler {
    type Request = Transfer;
    type Response = Balance;

    fn name(&self) -> &str {
        "Transfer"
    }

    async fn execute(&self, request: Transfer, _: &TransportCommand) -> Result<Balance, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.amount < 0 {
            return Err(ExtendedError::with_code("amount must be positive", 42).into());
        }
        Ok(Balance {
            balance: 100 - request.amount,
        })
    }
}

#[tokio::test]
async fn local_request_reply_test() {
    let transport = Arc::new(LocalTransport::new());
    let handler = Arc::new(TransferHandler {
        calls: AtomicUsize::new(0),
    });
    listen_handler(transport.clone(), handler.clone()).await.unwrap();

    let balance: Balance = transport
        .request("Transfer", &json!({"amount": 30}), CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(balance, Balance { balance: 70 });

    let error = transport
        .request::<_, Balance>("Transfer", &json!({"amount": -1}), CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, 42);

    let error = transport
        .request::<_, Balance>("Transfer", &json!({"value": 1}), CommandOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.code, codes::INVALID_DATA);

    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn local_buffered_before_listen_test() {
    let transport = Arc::new(LocalTransport::new());

    let sender = transport.clone();
    let reply = tokio::spawn(async move {
        sender
            .send_listen(AsyncCommand::new("Transfer", json!({"amount": 1})), CommandOptions::default())
            .await
    });
    tokio::task::yield_now().await;
    while transport.buffered("Transfer") == 0 {
        tokio::task::yield_now().await;
    }

    let handler = Arc::new(TransferHandler {
        calls: AtomicUsize::new(0),
    });
    listen_handler(transport.clone(), handler.clone()).await.unwrap();

    assert_eq!(reply.await.unwrap(), Ok(Some(json!({"balance": 99}))));
    assert_eq!(transport.buffered("Transfer"), 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn local_out_of_order_replies_test() {
    let transport = Arc::new(LocalTransport::new());
    let mut commands = transport.listen("Echo").await.unwrap();

    let first = AsyncCommand::new("Echo", json!(1));
    let second = AsyncCommand::new("Echo", json!(2));
    let replies = {
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::join!(
                transport.send_listen(first, CommandOptions::default()),
                transport.send_listen(second, CommandOptions::default()),
            )
        })
    };

    let a = commands.recv().await.unwrap();
    let b = commands.recv().await.unwrap();
    let request_b = b.request().clone();
    transport.complete(b, Ok(Some(request_b))).await.unwrap();
    let request_a = a.request().clone();
    transport.complete(a, Ok(Some(request_a))).await.unwrap();

    let (first, second) = replies.await.unwrap();
    assert_eq!(first, Ok(Some(json!(1))));
    assert_eq!(second, Ok(Some(json!(2))));
}

#[tokio::test]
async fn local_duplicate_send_listen_test() {
    let transport = Arc::new(LocalTransport::new());
    let mut commands = transport.listen("Echo").await.unwrap();

    let command = AsyncCommand::with_id("same-id", "Echo", json!("x"));
    let replies = {
        let transport = transport.clone();
        let duplicate = command.clone();
        tokio::spawn(async move {
            tokio::join!(
                transport.send_listen(command, CommandOptions::default()),
                transport.send_listen(duplicate, CommandOptions::default()),
            )
        })
    };

    let received = commands.recv().await.unwrap();
    transport.complete(received, Ok(Some(json!(null)))).await.unwrap();

    let (first, second) = replies.await.unwrap();
    assert_eq!(first, Ok(Some(json!(null))));
    assert_eq!(second, Ok(Some(json!(null))));
    assert!(commands.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn local_timeout_test() {
    let transport = LocalTransport::new();
    let _commands = transport.listen("Slow").await.unwrap();

    let response = transport
        .send_listen(
            AsyncCommand::empty("Slow"),
            CommandOptions::with_timeout(Duration::from_millis(100)),
        )
        .await;

    assert_eq!(response.unwrap_err().code, codes::TIMEOUT);
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn local_fire_and_forget_test() {
    let transport = LocalTransport::new();
    let mut commands = transport.listen("Notify").await.unwrap();

    transport
        .send(Command::new("Notify", json!({"to": "alice"})), CommandOptions::default())
        .await
        .unwrap();

    let command = commands.recv().await.unwrap();
    assert!(!command.is_async());
    transport.complete(command, Ok(None)).await.unwrap();
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn local_events_test() {
    let transport = LocalTransport::new();
    transport.dispatch(Event::new("Nobody", None)).await.unwrap();

    let mut first = transport.get_dispatcher("Changed").await.unwrap();
    let mut second = transport.get_dispatcher("Changed").await.unwrap();
    transport
        .dispatch(Event::new("Changed", Some(json!({"id": 1}))))
        .await
        .unwrap();

    assert_eq!(first.recv().await.unwrap().data, Some(json!({"id": 1})));
    assert_eq!(second.recv().await.unwrap().data, Some(json!({"id": 1})));
}
