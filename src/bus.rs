use std::net::SocketAddr;

use rs_pfcp::ie::{cause::CauseValue, fseid::Fseid};
use rs_pfcp::message::{
    session_deletion_request::SessionDeletionRequest,
    session_establishment_request::SessionEstablishmentRequest,
    session_modification_request::SessionModificationRequest,
};
use tokio::sync::{mpsc, oneshot};

use crate::conn::ConnError;

/// Channel capacity between the planes; senders block when a channel is
/// full, which is the proxy's flow-control primitive.
pub const BUS_CAPACITY: usize = 100;

/// Outcome of forwarding one session request to a UPF.
#[derive(Debug, Clone, Copy)]
pub struct ForwardReply {
    pub cause: CauseValue,
    /// UP-F-SEID returned by the UPF, present on accepted establishments.
    pub upf_fseid: Option<Fseid>,
}

impl ForwardReply {
    pub fn cause(cause: CauseValue) -> Self {
        Self {
            cause,
            upf_fseid: None,
        }
    }

    pub fn accepted(&self) -> bool {
        self.cause == CauseValue::RequestAccepted
    }
}

pub type ForwardResult = Result<ForwardReply, ConnError>;

/// Session Establishment Request travelling from the Up plane to the
/// Down plane, with the sink the Down side completes.
pub struct SesEstU2d {
    pub up_seid: u64,
    pub cp_seid: u64,
    pub msg: SessionEstablishmentRequest,
    pub resp: oneshot::Sender<ForwardResult>,
}

pub struct SesModU2d {
    pub up_seid: u64,
    pub msg: SessionModificationRequest,
    pub resp: oneshot::Sender<ForwardResult>,
}

pub struct SesDelU2d {
    pub up_seid: u64,
    pub msg: SessionDeletionRequest,
    pub resp: oneshot::Sender<ForwardResult>,
}

/// UPF-originated Session Report travelling Down→Up. `resp` is absent
/// for proxy-generated notifications (peer restart), where nobody waits
/// for the SMF's answer.
pub struct SesRepD2u {
    pub up_seid: u64,
    pub raw: Vec<u8>,
    pub resp: Option<oneshot::Sender<Result<CauseValue, ConnError>>>,
    /// When set, the Up plane drops its state for the session after
    /// forwarding the report.
    pub invalidate: bool,
}

/// Announcement of a newly associated backend, Down→Up.
#[derive(Debug, Clone)]
pub struct UpfD2u {
    pub node_id: String,
    pub addr: SocketAddr,
}

/// Sender half held by the Up plane.
#[derive(Clone)]
pub struct UpToDown {
    pub ses_est: mpsc::Sender<SesEstU2d>,
    pub ses_mod: mpsc::Sender<SesModU2d>,
    pub ses_del: mpsc::Sender<SesDelU2d>,
    pub reset_sessions: mpsc::Sender<()>,
}

/// Sender half held by the Down plane.
#[derive(Clone)]
pub struct DownToUp {
    pub reports: mpsc::Sender<SesRepD2u>,
    pub upfs: mpsc::Sender<UpfD2u>,
}

pub struct UpToDownRx {
    pub ses_est: mpsc::Receiver<SesEstU2d>,
    pub ses_mod: mpsc::Receiver<SesModU2d>,
    pub ses_del: mpsc::Receiver<SesDelU2d>,
    pub reset_sessions: mpsc::Receiver<()>,
}

pub struct DownToUpRx {
    pub reports: mpsc::Receiver<SesRepD2u>,
    pub upfs: mpsc::Receiver<UpfD2u>,
}

/// Creates both directions of the inter-plane bus.
pub fn channel() -> (UpToDown, UpToDownRx, DownToUp, DownToUpRx) {
    let (est_tx, est_rx) = mpsc::channel(BUS_CAPACITY);
    let (mod_tx, mod_rx) = mpsc::channel(BUS_CAPACITY);
    let (del_tx, del_rx) = mpsc::channel(BUS_CAPACITY);
    let (reset_tx, reset_rx) = mpsc::channel(BUS_CAPACITY);
    let (rep_tx, rep_rx) = mpsc::channel(BUS_CAPACITY);
    let (upf_tx, upf_rx) = mpsc::channel(BUS_CAPACITY);
    (
        UpToDown {
            ses_est: est_tx,
            ses_mod: mod_tx,
            ses_del: del_tx,
            reset_sessions: reset_tx,
        },
        UpToDownRx {
            ses_est: est_rx,
            ses_mod: mod_rx,
            ses_del: del_rx,
            reset_sessions: reset_rx,
        },
        DownToUp {
            reports: rep_tx,
            upfs: upf_tx,
        },
        DownToUpRx {
            reports: rep_rx,
            upfs: upf_rx,
        },
    )
}
