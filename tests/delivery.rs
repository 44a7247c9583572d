mod common;

use std::time::Duration;

use azure_iot_transport::{
    ClientEvent, ClientOptions, DeliveryTag, Disposition, Error, FileUploadNotificationReceiver,
    InboundNotification, Message, MessageKind, NotificationKind, SendOutcome, ServiceResponse,
    TransportEvent,
};
use common::*;

#[tokio::test(start_paused = true)]
async fn synchronous_confirmation_resolves_handle() {
    let (client, transport) = client();
    transport.set_auto_ack(true);
    client.open().await.unwrap();

    let delivered = client
        .send_message(Message::new(b"hello".to_vec()))
        .await
        .unwrap();
    assert_eq!(delivered.correlation_id.value(), 1);
    assert_eq!(transport.sent_kinds(), vec![MessageKind::Telemetry]);
}

#[tokio::test(start_paused = true)]
async fn permanent_send_error_fails_only_that_message() {
    let (client, transport) = client();
    client.open().await.unwrap();
    transport.push_send_result(Err(service_error(400)));

    let result = client.send_message(Message::new(vec![])).await;
    assert!(matches!(result, Err(Error::Service { status: 400, .. })));

    transport.set_auto_ack(true);
    client.send_message(Message::new(vec![])).await.unwrap();
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_send_error_resends_after_backoff() {
    let options = ClientOptions {
        ack_timeout_ms: 10_000,
        ..Default::default()
    };
    let (client, transport) = client_with(options);
    transport.set_auto_ack(true);
    client.open().await.unwrap();
    transport.push_send_result(Err(service_error(500)));

    let start = tokio::time::Instant::now();
    client.send_message(Message::new(vec![])).await.unwrap();

    // First backoff is 100ms with at most 20% jitter
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(120), "{:?}", elapsed);
    assert_eq!(transport.sent_ids(), vec![1, 1]);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn throttled_send_waits_for_retry_after() {
    let (client, transport) = client();
    transport.set_auto_ack(true);
    client.open().await.unwrap();
    transport.push_send_result(Err(Error::Service {
        status: 429,
        message: "throttled".into(),
        retry_after: Some(Duration::from_secs(3)),
    }));

    let start = tokio::time::Instant::now();
    client.send_message(Message::new(vec![])).await.unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "{:?}", elapsed);
    assert_eq!(transport.sent_ids(), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeout_is_accepted() {
    let (client, transport) = client();
    transport.set_auto_ack(true);
    client.open().await.unwrap();

    let delivered = client
        .submit_with_timeout(MessageKind::Telemetry, Message::new(vec![]), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(delivered.correlation_id.value(), 1);
}

#[tokio::test(start_paused = true)]
async fn link_failure_on_send_reconnects_and_resends() {
    let (client, transport) = client();
    transport.set_auto_ack(true);
    client.open().await.unwrap();
    transport.push_send_result(Err(reset()));

    client.send_message(Message::new(vec![])).await.unwrap();

    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.sent_ids(), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn rejected_message_fails_with_service_error() {
    let (client, transport) = client();
    client.open().await.unwrap();

    let handle = client.submit(MessageKind::TwinPatch, Message::new(b"{}".to_vec()));
    settle().await;
    transport.inject(TransportEvent::Rejected {
        correlation_id: handle.correlation_id(),
        error: service_error(400),
    });

    assert!(matches!(
        handle.await,
        Err(Error::Service { status: 400, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn duplicate_acknowledgement_is_ignored() {
    let (client, transport) = client();
    client.open().await.unwrap();

    let first = client.submit(MessageKind::Telemetry, Message::new(vec![]));
    let second = client.submit(MessageKind::Telemetry, Message::new(vec![]));
    settle().await;

    transport.ack(first.correlation_id());
    transport.ack(first.correlation_id());
    assert!(first.await.is_ok());

    settle().await;
    transport.ack(second.correlation_id());
    assert_eq!(second.await.unwrap().correlation_id.value(), 2);
}

#[tokio::test(start_paused = true)]
async fn twin_response_is_returned_to_caller() {
    let (client, transport) = client();
    client.open().await.unwrap();

    let getter = client.clone();
    let twin = tokio::spawn(async move { getter.get_twin().await });
    settle().await;

    let mut response = ServiceResponse::new(200, br#"{"desired":{"$version":3}}"#.to_vec());
    response.version = Some(3);
    transport.inject(TransportEvent::Acknowledged {
        correlation_id: azure_iot_transport::CorrelationId::new(1),
        response: Some(response),
    });

    let document = twin.await.unwrap().unwrap();
    assert_eq!(document["desired"]["$version"], 3);
}

#[tokio::test(start_paused = true)]
async fn cancelled_message_resolves_cancelled() {
    let (client, _transport) = client();
    client.open().await.unwrap();

    let handle = client.submit(MessageKind::Telemetry, Message::new(vec![]));
    client.cancel(handle.correlation_id());

    assert!(matches!(handle.await, Err(Error::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn submit_on_closed_client_fails() {
    let (client, transport) = client();

    let result = client.send_message(Message::new(vec![])).await;

    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert!(transport.sent_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn notifications_reach_the_application_and_can_be_settled() {
    let (client, transport) = client();
    let mut events = client.take_event_receiver().unwrap();
    assert!(client.take_event_receiver().is_none());
    client.open().await.unwrap();

    transport.inject(TransportEvent::Notification(InboundNotification {
        kind: NotificationKind::CloudToDevice,
        message: Message::new(b"reboot".to_vec()),
        delivery_tag: Some(DeliveryTag::new(12)),
    }));

    let notification = loop {
        match events.recv().await.unwrap() {
            ClientEvent::Notification(notification) => break notification,
            ClientEvent::ConnectionStatus { .. } => continue,
        }
    };
    assert_eq!(notification.message.body, b"reboot".to_vec());

    let tag = notification.delivery_tag.unwrap();
    client.acknowledge(&tag, Disposition::Complete).await.unwrap();
    assert_eq!(transport.settled(), vec![(tag, Disposition::Complete)]);
}

#[tokio::test(start_paused = true)]
async fn unsupported_operation_is_not_retried() {
    let (client, transport) = client();
    client.open().await.unwrap();
    transport.push_send_result(Err(Error::Transport {
        kind: azure_iot_transport::TransportErrorKind::Unsupported,
        message: "file upload is only available over HTTPS".into(),
    }));

    let result = client.request_file_upload_sas("dev/file.txt").await;

    assert!(matches!(result, Err(Error::Transport { .. })));
    assert_eq!(transport.sent_ids(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn file_upload_sas_is_parsed() {
    let (client, transport) = client();
    client.open().await.unwrap();
    transport.push_send_result(Ok(SendOutcome::Acknowledged(Some(ServiceResponse::new(
        200,
        br#"{"correlationId":"c1","hostName":"acct.blob.core.windows.net","containerName":"uploads","blobName":"dev/file.txt","sasToken":"?sig=x"}"#.to_vec(),
    )))));

    let sas = client.request_file_upload_sas("file.txt").await.unwrap();

    assert_eq!(sas.correlation_id, "c1");
    assert_eq!(
        transport.sent_kinds(),
        vec![MessageKind::FileUploadRequest {
            blob_name: "file.txt".into()
        }]
    );
}

fn upload_notification(tag: u64, body: &str) -> TransportEvent {
    TransportEvent::Notification(InboundNotification {
        kind: NotificationKind::FileUploadNotification,
        message: Message::new(body.as_bytes().to_vec()),
        delivery_tag: Some(DeliveryTag::new(tag)),
    })
}

#[tokio::test(start_paused = true)]
async fn file_upload_notifications_are_received_and_completed() {
    let (transport, handle) = scripted();
    let mut receiver = FileUploadNotificationReceiver::new(transport);

    assert!(matches!(
        receiver.receive().await,
        Err(Error::ConnectionClosed)
    ));
    receiver.open().await.unwrap();

    handle.inject(upload_notification(
        1,
        r#"{"deviceId":"dev1","blobUri":"https://acct.blob.core.windows.net/c/dev1/a.txt","blobName":"dev1/a.txt","lastUpdatedTime":"2026-10-14T08:00:00Z","blobSizeInBytes":5,"enqueuedTimeUtc":"2026-10-14T08:00:01Z"}"#,
    ));
    let notification = receiver.receive().await.unwrap().unwrap();
    assert_eq!(notification.blob_name, "dev1/a.txt");
    assert_eq!(
        handle.settled(),
        vec![(DeliveryTag::new(1), Disposition::Complete)]
    );

    let start = tokio::time::Instant::now();
    assert!(receiver
        .receive_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .is_none());
    assert_eq!(start.elapsed(), Duration::from_secs(5));

    handle.inject(upload_notification(2, "not json"));
    assert!(receiver.receive().await.is_err());
    assert_eq!(
        handle.settled().last(),
        Some(&(DeliveryTag::new(2), Disposition::Reject))
    );

    receiver.close().await.unwrap();
    receiver.close().await.unwrap();
    assert_eq!(handle.close_count(), 1);
}
