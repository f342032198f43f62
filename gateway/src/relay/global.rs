//! Session-level request relay.

use std::sync::Arc;

use tracing::debug;

use crate::error::{RelayError, Result};
use crate::transport::{GlobalRequestStream, Session};

/// Forward global requests from the source to `target`, in order, handing
/// each reply back to its requester when one was asked for.
///
/// Returns once the source stops producing requests, or on the first send
/// or reply failure. `target` is closed on every way out.
pub async fn forward_global_requests<S: Session>(
    target: Option<Arc<S>>,
    requests: Option<GlobalRequestStream>,
) -> Result<()> {
    let target = target.ok_or(RelayError::TargetMissing)?;
    let requests = requests.ok_or(RelayError::RequestsMissing)?;

    let result = relay_requests(target.as_ref(), requests).await;
    target.close().await;
    result
}

async fn relay_requests<S: Session>(target: &S, mut requests: GlobalRequestStream) -> Result<()> {
    while let Some(request) = requests.recv().await {
        let reply = target
            .send_global_request(request.kind(), request.want_reply(), request.payload())
            .await?;
        let kind = request.kind().clone();
        let accepted = reply.accepted;
        if request.want_reply() {
            request.reply(reply)?;
        }
        debug!(kind = %kind, accepted, "Forward ssh request");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testkit::MockSession;
    use crate::request::GlobalRequest;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn request(i: usize) -> (GlobalRequest, crate::request::ReplyReceiver) {
        GlobalRequest::with_reply(format!("req-{i}"), Bytes::from(format!("payload-{i}")))
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_fast() {
        let session = Arc::new(MockSession::new());
        let (_tx, rx) = mpsc::channel::<GlobalRequest>(1);

        let err = forward_global_requests::<MockSession>(None, Some(rx))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TargetMissing));

        let err = forward_global_requests(Some(session.clone()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RequestsMissing));
        assert_eq!(session.close_count(), 0);
        assert!(session.global_requests().is_empty());
    }

    #[tokio::test]
    async fn test_requests_and_replies_keep_order() {
        let session = Arc::new(MockSession::new());
        let (tx, rx) = mpsc::channel(16);

        let mut replies = Vec::new();
        for i in 0..5 {
            let (req, reply) = request(i);
            tx.send(req).await.unwrap();
            replies.push(reply);
        }
        drop(tx);

        forward_global_requests(Some(session.clone()), Some(rx))
            .await
            .unwrap();

        let sent: Vec<_> = session
            .global_requests()
            .into_iter()
            .map(|(kind, want_reply, _)| (kind, want_reply))
            .collect();
        let expected: Vec<_> = (0..5).map(|i| (format!("req-{i}"), true)).collect();
        assert_eq!(sent, expected);

        for (i, reply) in replies.into_iter().enumerate() {
            let reply = reply.await.unwrap();
            assert!(reply.accepted);
            assert_eq!(reply.payload, Bytes::from(format!("payload-{i}")));
        }
        assert_eq!(session.close_count(), 1);
    }

    #[tokio::test]
    async fn test_no_reply_when_none_wanted() {
        let session = Arc::new(MockSession::new());
        let (tx, rx) = mpsc::channel(4);
        tx.send(GlobalRequest::new(
            "keepalive@openssh.com".to_string(),
            Bytes::new(),
        ))
        .await
        .unwrap();
        drop(tx);

        forward_global_requests(Some(session.clone()), Some(rx))
            .await
            .unwrap();

        let sent = session.global_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "keepalive@openssh.com");
        assert!(!sent[0].1);
    }

    #[tokio::test]
    async fn test_send_failure_stops_relay() {
        let session = Arc::new(MockSession::new().fail_global_at(2));
        let (tx, rx) = mpsc::channel(16);

        let mut replies = Vec::new();
        for i in 0..5 {
            let (req, reply) = request(i);
            tx.send(req).await.unwrap();
            replies.push(reply);
        }

        let err = forward_global_requests(Some(session.clone()), Some(rx))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));

        // Requests 3 and 4 were never attempted.
        assert_eq!(session.global_requests().len(), 3);
        assert_eq!(session.close_count(), 1);

        let mut replies = replies.into_iter();
        assert!(replies.next().unwrap().await.is_ok());
        assert!(replies.next().unwrap().await.is_ok());
        // The failing request's reply sink is dropped unanswered.
        assert!(replies.next().unwrap().await.is_err());
    }

    #[tokio::test]
    async fn test_reply_failure_stops_relay() {
        let session = Arc::new(MockSession::new());
        let (tx, rx) = mpsc::channel(4);

        let (req, reply) = request(0);
        drop(reply);
        tx.send(req).await.unwrap();
        let (req, _reply) = request(1);
        tx.send(req).await.unwrap();
        drop(tx);

        let err = forward_global_requests(Some(session.clone()), Some(rx))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ReplyDropped));
        assert_eq!(session.global_requests().len(), 1);
        assert_eq!(session.close_count(), 1);
    }
}
