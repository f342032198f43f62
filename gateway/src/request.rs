//! Global and channel requests as they travel through the relay.
//!
//! A request owns its reply sink, so answering consumes it: a request that
//! wanted a reply can be answered at most once, and one that did not has
//! nowhere to send a reply to.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{RelayError, Result};

/// Channel request types the relay knows by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Shell,
    Exec,
    Env,
    PtyReq,
    WindowChange,
    Subsystem,
    Signal,
    ExitStatus,
    ExitSignal,
    X11Req,
    AgentForward,
    XonXoff,
    EndOfWrite,
    Other(String),
}

impl RequestKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "shell" => Self::Shell,
            "exec" => Self::Exec,
            "env" => Self::Env,
            "pty-req" => Self::PtyReq,
            "window-change" => Self::WindowChange,
            "subsystem" => Self::Subsystem,
            "signal" => Self::Signal,
            "exit-status" => Self::ExitStatus,
            "exit-signal" => Self::ExitSignal,
            "x11-req" => Self::X11Req,
            "auth-agent-req@openssh.com" => Self::AgentForward,
            "xon-xoff" => Self::XonXoff,
            "eow@openssh.com" => Self::EndOfWrite,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Shell => "shell",
            Self::Exec => "exec",
            Self::Env => "env",
            Self::PtyReq => "pty-req",
            Self::WindowChange => "window-change",
            Self::Subsystem => "subsystem",
            Self::Signal => "signal",
            Self::ExitStatus => "exit-status",
            Self::ExitSignal => "exit-signal",
            Self::X11Req => "x11-req",
            Self::AgentForward => "auth-agent-req@openssh.com",
            Self::XonXoff => "xon-xoff",
            Self::EndOfWrite => "eow@openssh.com",
            Self::Other(name) => name,
        }
    }

    /// `shell` and `exec` start a program on the remote side, which is the
    /// last moment environment variables can still be set.
    pub fn starts_program(&self) -> bool {
        matches!(self, Self::Shell | Self::Exec)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a request as reported by the peer that handled it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub accepted: bool,
    pub payload: Bytes,
}

impl Reply {
    pub fn accepted(payload: impl Into<Bytes>) -> Self {
        Self {
            accepted: true,
            payload: payload.into(),
        }
    }

    pub fn rejected() -> Self {
        Self::default()
    }
}

pub type ReplyReceiver = oneshot::Receiver<Reply>;

/// A request of kind `K` plus, when the sender wants one, its reply sink.
#[derive(Debug)]
pub struct Request<K> {
    kind: K,
    payload: Bytes,
    reply: Option<oneshot::Sender<Reply>>,
}

/// Session-scoped request such as `tcpip-forward` or `keepalive@openssh.com`.
pub type GlobalRequest = Request<String>;

/// Request scoped to one channel.
pub type ChannelRequest = Request<RequestKind>;

impl<K> Request<K> {
    /// A request that does not expect a reply.
    pub fn new(kind: K, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            reply: None,
        }
    }

    /// A request that expects a reply, delivered on the returned receiver.
    pub fn with_reply(kind: K, payload: impl Into<Bytes>) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind,
            payload: payload.into(),
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn want_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the request. A request that did not want a reply ignores it.
    pub fn reply(self, reply: Reply) -> Result<()> {
        match self.reply {
            Some(tx) => tx.send(reply).map_err(|_| RelayError::ReplyDropped),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_names() {
        for name in [
            "shell",
            "exec",
            "env",
            "pty-req",
            "window-change",
            "subsystem",
            "signal",
            "exit-status",
            "exit-signal",
            "x11-req",
            "auth-agent-req@openssh.com",
            "xon-xoff",
            "eow@openssh.com",
            "keepalive@openssh.com",
        ] {
            assert_eq!(RequestKind::from_name(name).as_str(), name);
        }
        assert_eq!(
            RequestKind::from_name("simple@putty.projects.tartarus.org"),
            RequestKind::Other("simple@putty.projects.tartarus.org".to_string())
        );
    }

    #[test]
    fn test_only_shell_and_exec_start_programs() {
        assert!(RequestKind::Shell.starts_program());
        assert!(RequestKind::Exec.starts_program());
        assert!(!RequestKind::Subsystem.starts_program());
        assert!(!RequestKind::Env.starts_program());
    }

    #[tokio::test]
    async fn test_reply_reaches_requester() {
        let (req, rx) = ChannelRequest::with_reply(RequestKind::Exec, "ls");
        assert!(req.want_reply());
        req.reply(Reply::accepted(Bytes::new())).unwrap();
        assert!(rx.await.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_reply_to_departed_requester_fails() {
        let (req, rx) = GlobalRequest::with_reply("tcpip-forward".to_string(), Bytes::new());
        drop(rx);
        assert!(matches!(
            req.reply(Reply::rejected()),
            Err(RelayError::ReplyDropped)
        ));
    }

    #[test]
    fn test_reply_without_sink_is_noop() {
        let req = ChannelRequest::new(RequestKind::WindowChange, Bytes::new());
        assert!(!req.want_reply());
        assert!(req.reply(Reply::accepted(Bytes::new())).is_ok());
    }
}
