//! Server pushed EVENT frames, also reused by SCHEMA_CHANGE results.

use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        };

        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(ParseError::UnknownEventType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl From<&str> for SchemaChangeType {
    fn from(s: &str) -> Self {
        match s {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        }
    }
}

impl Event {
    pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(
                version, buf,
            )?)),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change_type = SchemaChangeType::from(types::read_string(buf)?);

        // v2 only knows keyspaces and tables: <change><keyspace><table>
        if version == ProtocolVersion::V2 {
            let keyspace_name = types::read_string(buf)?.to_string();
            let table = types::read_string(buf)?;
            return Ok(if table.is_empty() {
                Self::KeyspaceChange {
                    change_type,
                    keyspace_name,
                }
            } else {
                Self::TableChange {
                    change_type,
                    keyspace_name,
                    object_name: table.to_string(),
                }
            });
        }

        let target = types::read_string(buf)?;
        let keyspace_name = types::read_string(buf)?.to_string();

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: types::read_string(buf)?.to_string(),
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: types::read_string(buf)?.to_string(),
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type,
                keyspace_name,
                function_name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: types::read_string(buf)?.to_string(),
                arguments: types::read_string_list(buf)?,
            }),
            _ => Err(ParseError::BadData {
                what: "schema change target",
                detail: target.to_string(),
            }),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(ParseError::BadData {
                what: "topology change",
                detail: type_of_change.to_string(),
            }),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadData {
                what: "status change",
                detail: type_of_change.to_string(),
            }),
        }
    }
}
