//! Node decision core: topology state, job bookkeeping, splitting plans.
//! The daemon passes commands and frames in; plans for it to execute come
//! back out. All calls happen on the daemon's reactor task.

use std::collections::HashMap;

use crate::protocol::{AddressFrame, WorkFrame, CHUNK_SIZE};
use crate::split::{self, Share};

/// Identifies one registered peer connection. Allocated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

/// Arguments of a START command, as parsed by the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    pub locator: String,
    pub checker: String,
    pub start: u32,
    pub end: u32,
    pub filename: String,
}

/// Everything the host must do for one originated job: run the local share,
/// send one work frame per remaining share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub job_id: u32,
    pub local: Option<Share>,
    pub forwards: Vec<(ConnId, WorkFrame)>,
}

/// Everything the host must do for one received work frame. Forwards are
/// delegated before the local share runs, so children start early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    pub local: Option<Share>,
    pub forwards: Vec<(ConnId, WorkFrame)>,
    /// The received frame; carries the locator, checker and filename the
    /// local share runs with.
    pub frame: WorkFrame,
}

/// Reparent notices to send, one per child, before any child closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeavePlan {
    pub notices: Vec<(ConnId, AddressFrame)>,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaveError {
    #[error("this node is the tree root; it has no parent to adopt its children")]
    Root,
}

/// Per-node coordinator: the explicit children set, the optional upstream
/// port, the monotonic job-id counter and the id -> filename map for jobs
/// this node originated.
#[derive(Debug)]
pub struct NodeCore {
    listen_port: u16,
    parent_port: Option<u16>,
    children: Vec<ConnId>,
    next_job_id: u32,
    id_filename: HashMap<u32, String>,
}

impl NodeCore {
    pub fn new(listen_port: u16, parent_port: Option<u16>) -> Self {
        Self {
            listen_port,
            parent_port,
            children: Vec::new(),
            next_job_id: 0,
            id_filename: HashMap::new(),
        }
    }

    pub fn register_child(&mut self, id: ConnId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
    }

    /// Forget a connection; it is simply absent from subsequent splits.
    pub fn remove_conn(&mut self, id: ConnId) {
        self.children.retain(|c| *c != id);
    }

    pub fn children(&self) -> &[ConnId] {
        &self.children
    }

    pub fn parent_port(&self) -> Option<u16> {
        self.parent_port
    }

    pub fn set_parent_port(&mut self, port: Option<u16>) {
        self.parent_port = port;
    }

    /// Result filename recorded for a job this node originated.
    pub fn job_filename(&self, job_id: u32) -> Option<&str> {
        self.id_filename.get(&job_id).map(String::as_str)
    }

    /// Allocate a job id and split the requested range across this node and
    /// its children: the first share runs locally, every other share goes to
    /// one child as a work frame.
    pub fn start_job(&mut self, args: &StartArgs) -> JobPlan {
        self.next_job_id += 1;
        let job_id = self.next_job_id;
        self.id_filename.insert(job_id, args.filename.clone());

        let mut shares =
            split::plan_shares(args.start, args.end, 1 + self.children.len()).into_iter();
        let local = shares.next();
        let forwards = self
            .children
            .iter()
            .zip(shares)
            .map(|(&conn, share)| {
                (
                    conn,
                    WorkFrame {
                        src_port: self.listen_port,
                        dst_port: self.listen_port,
                        job_id,
                        start: share.start,
                        end: share.end,
                        locator: args.locator.clone(),
                        checker: args.checker.clone(),
                        filename: args.filename.clone(),
                    },
                )
            })
            .collect();
        JobPlan {
            job_id,
            local,
            forwards,
        }
    }

    /// Apply the chunk rule to a received work frame. At or below
    /// [`CHUNK_SIZE`] values, or with no children, the whole range runs
    /// locally; otherwise the first chunk runs locally and the tail splits
    /// across the children alone. Forwarded frames pass the original
    /// source/destination ports, job id and strings through untouched.
    pub fn handle_work(&mut self, frame: WorkFrame) -> WorkPlan {
        let span = frame.span();
        if span == 0 {
            return WorkPlan {
                local: None,
                forwards: Vec::new(),
                frame,
            };
        }
        if span <= u64::from(CHUNK_SIZE) || self.children.is_empty() {
            return WorkPlan {
                local: Some(Share {
                    start: frame.start,
                    end: frame.end,
                }),
                forwards: Vec::new(),
                frame,
            };
        }
        let (head, tail) = split::chunk(frame.start, frame.end);
        let forwards = match tail {
            Some(tail) => split::plan_shares(tail.start, tail.end, self.children.len())
                .into_iter()
                .zip(self.children.iter())
                .map(|(share, &conn)| {
                    (
                        conn,
                        WorkFrame {
                            src_port: frame.src_port,
                            dst_port: frame.dst_port,
                            job_id: frame.job_id,
                            start: share.start,
                            end: share.end,
                            locator: frame.locator.clone(),
                            checker: frame.checker.clone(),
                            filename: frame.filename.clone(),
                        },
                    )
                })
                .collect(),
            None => Vec::new(),
        };
        WorkPlan {
            local: Some(head),
            forwards,
            frame,
        }
    }

    /// Plan a graceful leave: one reparent notice per child, carrying the
    /// parent's port. The root has no parent to hand children to and cannot
    /// leave.
    pub fn leave(&self) -> Result<LeavePlan, LeaveError> {
        let port = self.parent_port.ok_or(LeaveError::Root)?;
        Ok(LeavePlan {
            notices: self
                .children
                .iter()
                .map(|&conn| (conn, AddressFrame { port }))
                .collect(),
        })
    }
}
