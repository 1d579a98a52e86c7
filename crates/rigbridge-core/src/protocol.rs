//! Session protocol state machine
//!
//! One client session exchanges text commands and text/binary payloads with
//! the server. Each inbound frame is handled to completion before the next
//! one is read, so the machine holds a single [`SessionState`].
//!
//! | Frame | State | Reply |
//! |---|---|---|
//! | `get_pose` | any | binary pose frame |
//! | `start_mapping` | any | `start_mapping_done`, enters `Importing` |
//! | binary payload | `Importing` | `import_bone_done` / `import_bone_failed` |
//! | `connect` | any | mapping buffer (text) / `connect_failed` |
//! | `disconnect` | any | `disconnect_done` |
//! | `start_reconnect` | any | `start_reconnect_done`, enters `Reconnecting` |
//! | text payload | `Reconnecting` | `import_mapping_data_done` / `import_mapping_data_failed` |
//! | `map:<node>:<bone>` | any | `map_done` / `map_failed` |
//!
//! `disconnect` passes through a transient disconnecting step: it runs to
//! completion with pose updates suspended and the session lands in `Idle`.

use std::fmt;
use tracing::{debug, info, warn};

use crate::nnb::MappingBuffer;

pub const START_MAPPING_DONE: &str = "start_mapping_done";
pub const IMPORT_BONE_DONE: &str = "import_bone_done";
pub const IMPORT_BONE_FAILED: &str = "import_bone_failed";
pub const CONNECT_FAILED: &str = "connect_failed";
pub const DISCONNECT_DONE: &str = "disconnect_done";
pub const START_RECONNECT_DONE: &str = "start_reconnect_done";
pub const IMPORT_MAPPING_DATA_DONE: &str = "import_mapping_data_done";
pub const IMPORT_MAPPING_DATA_FAILED: &str = "import_mapping_data_failed";
pub const MAP_DONE: &str = "map_done";
pub const MAP_FAILED: &str = "map_failed";

/// Operations the session drives on the retargeting side.
///
/// Every operation reports plain success or failure; errors are logged by
/// the implementation.
pub trait MappingHost {
    /// Encoded pose frame of the mapped nodes
    fn pose_frame(&mut self) -> Vec<u8>;

    /// Import a skeleton topology frame as the new user rig.
    fn import_skeleton(&mut self, payload: &[u8]) -> bool;

    /// Register and apply the bone groups. Returns the mapping buffer on success.
    fn connect(&mut self) -> Option<MappingBuffer>;

    fn disconnect(&mut self);

    /// Re-apply a persisted mapping buffer.
    fn reconnect(&mut self, payload: &[u8]) -> bool;

    /// Map a user node (by name) to a template bone.
    fn map_bone(&mut self, node: &str, template: &str) -> bool;
}

/// Inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Text command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetPose,
    StartMapping,
    Connect,
    Disconnect,
    StartReconnect,
    Map { node: String, template: String },
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "get_pose" => Some(Self::GetPose),
            "start_mapping" => Some(Self::StartMapping),
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "start_reconnect" => Some(Self::StartReconnect),
            other => {
                let rest = other.strip_prefix("map:")?;
                let (node, template) = rest.rsplit_once(':')?;
                if node.is_empty() || template.is_empty() {
                    return None;
                }
                Some(Self::Map {
                    node: node.to_string(),
                    template: template.to_string(),
                })
            }
        }
    }
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Binary pose frame
    Pose(Vec<u8>),
    /// Mapping buffer, sent as text
    Mapping(MappingBuffer),
    /// Status keyword
    Status(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Waiting for a binary skeleton topology
    Importing,
    /// A mapping is applied
    Connected,
    /// Waiting for a persisted mapping buffer
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Importing => "importing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Protocol state of one client session
#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether pose updates must be suspended while `inbound` is handled
    pub fn suspends_updates(inbound: Inbound<'_>) -> bool {
        !matches!(inbound, Inbound::Text(text) if Command::parse(text) == Some(Command::GetPose))
    }

    /// Handle one inbound frame. Returns the reply to send, if any.
    pub fn handle<H: MappingHost + ?Sized>(&mut self, host: &mut H, inbound: Inbound<'_>) -> Option<Reply> {
        match (self.state, inbound) {
            (SessionState::Importing, Inbound::Binary(payload)) => {
                self.state = SessionState::Idle;
                if host.import_skeleton(payload) {
                    info!(bytes = payload.len(), "Skeleton imported");
                    Some(Reply::Status(IMPORT_BONE_DONE))
                } else {
                    Some(Reply::Status(IMPORT_BONE_FAILED))
                }
            }
            (SessionState::Importing, Inbound::Text(text)) => match Command::parse(text) {
                Some(command) => {
                    debug!("Import cancelled by command");
                    self.state = SessionState::Idle;
                    Some(self.run(host, command))
                }
                None => {
                    warn!("Expected a binary skeleton frame");
                    self.state = SessionState::Idle;
                    Some(Reply::Status(IMPORT_BONE_FAILED))
                }
            },
            (SessionState::Reconnecting, Inbound::Text(text)) => match Command::parse(text) {
                Some(command) => {
                    debug!("Reconnect cancelled by command");
                    self.state = SessionState::Idle;
                    Some(self.run(host, command))
                }
                None => {
                    if host.reconnect(text.as_bytes()) {
                        self.state = SessionState::Connected;
                        info!("Mapping reconnected");
                        Some(Reply::Status(IMPORT_MAPPING_DATA_DONE))
                    } else {
                        self.state = SessionState::Idle;
                        Some(Reply::Status(IMPORT_MAPPING_DATA_FAILED))
                    }
                }
            },
            (SessionState::Reconnecting, Inbound::Binary(_)) => {
                warn!("Expected a text mapping buffer");
                self.state = SessionState::Idle;
                Some(Reply::Status(IMPORT_MAPPING_DATA_FAILED))
            }
            (_, Inbound::Text(text)) => match Command::parse(text) {
                Some(command) => Some(self.run(host, command)),
                None => {
                    debug!(frame = text, "Ignoring unrecognized frame");
                    None
                }
            },
            (_, Inbound::Binary(payload)) => {
                debug!(bytes = payload.len(), "Ignoring binary frame outside import");
                None
            }
        }
    }

    fn run<H: MappingHost + ?Sized>(&mut self, host: &mut H, command: Command) -> Reply {
        match command {
            Command::GetPose => Reply::Pose(host.pose_frame()),
            Command::StartMapping => {
                self.state = SessionState::Importing;
                Reply::Status(START_MAPPING_DONE)
            }
            Command::Connect => match host.connect() {
                Some(buffer) if !buffer.is_empty() => {
                    self.state = SessionState::Connected;
                    Reply::Mapping(buffer)
                }
                _ => {
                    self.state = SessionState::Idle;
                    Reply::Status(CONNECT_FAILED)
                }
            },
            Command::Disconnect => {
                host.disconnect();
                self.state = SessionState::Idle;
                Reply::Status(DISCONNECT_DONE)
            }
            Command::StartReconnect => {
                self.state = SessionState::Reconnecting;
                Reply::Status(START_RECONNECT_DONE)
            }
            Command::Map { node, template } => {
                if host.map_bone(&node, &template) {
                    Reply::Status(MAP_DONE)
                } else {
                    Reply::Status(MAP_FAILED)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StubHost {
        imported: Vec<Vec<u8>>,
        reconnected: Vec<Vec<u8>>,
        connect_ok: bool,
        disconnects: usize,
        mapped: Vec<(String, String)>,
    }

    impl MappingHost for StubHost {
        fn pose_frame(&mut self) -> Vec<u8> {
            vec![0xa1, 0x00]
        }

        fn import_skeleton(&mut self, payload: &[u8]) -> bool {
            self.imported.push(payload.to_vec());
            payload != b"bad"
        }

        fn connect(&mut self) -> Option<MappingBuffer> {
            self.connect_ok
                .then(|| MappingBuffer::from("<nnb/>".to_string()))
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }

        fn reconnect(&mut self, payload: &[u8]) -> bool {
            self.reconnected.push(payload.to_vec());
            payload.starts_with(b"<nnb")
        }

        fn map_bone(&mut self, node: &str, template: &str) -> bool {
            self.mapped.push((node.to_string(), template.to_string()));
            template.ends_with("_bb_")
        }
    }

    fn status(reply: Option<Reply>) -> &'static str {
        match reply {
            Some(Reply::Status(s)) => s,
            other => panic!("expected status reply, got {:?}", other),
        }
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("get_pose"), Some(Command::GetPose));
        assert_eq!(Command::parse(" connect\n"), Some(Command::Connect));
        assert_eq!(
            Command::parse("map:Left:Arm:leftarm_bb_"),
            Some(Command::Map {
                node: "Left:Arm".into(),
                template: "leftarm_bb_".into()
            })
        );
        assert_eq!(Command::parse("map::hips_bb_"), None);
        assert_eq!(Command::parse("hello"), None);
    }

    #[test]
    fn test_import_after_start_mapping() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        assert_eq!(status(session.handle(&mut host, Inbound::Text("start_mapping"))), START_MAPPING_DONE);
        assert_eq!(session.state(), SessionState::Importing);

        assert_eq!(status(session.handle(&mut host, Inbound::Binary(b"rig"))), IMPORT_BONE_DONE);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(host.imported.len(), 1);

        session.handle(&mut host, Inbound::Text("start_mapping"));
        assert_eq!(status(session.handle(&mut host, Inbound::Binary(b"bad"))), IMPORT_BONE_FAILED);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_binary_without_start_mapping_is_ignored() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        assert_eq!(session.handle(&mut host, Inbound::Binary(b"rig")), None);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(host.imported.is_empty());
        assert_eq!(session.handle(&mut host, Inbound::Text("what")), None);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        assert_eq!(status(session.handle(&mut host, Inbound::Text("connect"))), CONNECT_FAILED);
        assert_eq!(session.state(), SessionState::Idle);

        host.connect_ok = true;
        match session.handle(&mut host, Inbound::Text("connect")) {
            Some(Reply::Mapping(buffer)) => assert_eq!(buffer.as_bytes(), b"<nnb/>"),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Connected);

        assert_eq!(status(session.handle(&mut host, Inbound::Text("disconnect"))), DISCONNECT_DONE);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(host.disconnects, 1);
    }

    #[test]
    fn test_reconnect() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        assert_eq!(
            status(session.handle(&mut host, Inbound::Text("start_reconnect"))),
            START_RECONNECT_DONE
        );
        assert_eq!(
            status(session.handle(&mut host, Inbound::Text("<nnb version=\"1.0\"/>"))),
            IMPORT_MAPPING_DATA_DONE
        );
        assert_eq!(session.state(), SessionState::Connected);

        session.handle(&mut host, Inbound::Text("start_reconnect"));
        assert_eq!(
            status(session.handle(&mut host, Inbound::Text("garbage"))),
            IMPORT_MAPPING_DATA_FAILED
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_wrong_frame_type_fails_sub_state() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        session.handle(&mut host, Inbound::Text("start_reconnect"));
        assert_eq!(
            status(session.handle(&mut host, Inbound::Binary(b"<nnb/>"))),
            IMPORT_MAPPING_DATA_FAILED
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(host.reconnected.is_empty());

        session.handle(&mut host, Inbound::Text("start_mapping"));
        assert_eq!(status(session.handle(&mut host, Inbound::Text("rig"))), IMPORT_BONE_FAILED);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_command_cancels_sub_state() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        session.handle(&mut host, Inbound::Text("start_mapping"));
        match session.handle(&mut host, Inbound::Text("get_pose")) {
            Some(Reply::Pose(bytes)) => assert_eq!(bytes, vec![0xa1, 0x00]),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_map_command() {
        let mut host = StubHost::default();
        let mut session = Session::new();

        assert_eq!(status(session.handle(&mut host, Inbound::Text("map:Hips:hips_bb_"))), MAP_DONE);
        assert_eq!(status(session.handle(&mut host, Inbound::Text("map:Hips:hips"))), MAP_FAILED);
        assert_eq!(host.mapped[0], ("Hips".to_string(), "hips_bb_".to_string()));
    }

    #[test]
    fn test_suspends_updates() {
        assert!(!Session::suspends_updates(Inbound::Text("get_pose")));
        assert!(Session::suspends_updates(Inbound::Text("connect")));
        assert!(Session::suspends_updates(Inbound::Text("disconnect")));
        assert!(Session::suspends_updates(Inbound::Binary(b"rig")));
    }
}
