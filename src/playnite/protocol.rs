//! Wire protocol shared with the Playnite plugin: newline-delimited JSON
//! in both directions, unknown fields tolerated on both sides.

use serde::{Deserialize, Serialize};

/// Named pipe the plugin publishes.
pub const PLAYNITE_PIPE: &str = "Sunshine.PlayniteExtension";

/// One library game as reported by the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayniteGame {
    pub id: String,
    pub name: String,
    /// ISO-8601 UTC, possibly with fractional seconds
    pub last_played: String,
    pub installed: bool,
    pub categories: Vec<String>,
    pub plugin_id: String,
    pub plugin_name: String,
    pub exe: String,
    pub working_dir: String,
    pub box_art_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayniteCategory {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaynitePlugin {
    pub id: String,
    pub name: String,
}

/// Inbound messages, dispatched on the `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    Categories {
        #[serde(default)]
        categories: Vec<PlayniteCategory>,
    },
    Plugins {
        #[serde(default)]
        plugins: Vec<PlaynitePlugin>,
    },
    Games {
        #[serde(default)]
        games: Vec<PlayniteGame>,
    },
    Status {
        #[serde(default)]
        name: String,
        #[serde(default)]
        id: String,
        #[serde(default)]
        exe: String,
        #[serde(default)]
        install_dir: String,
    },
}

/// Outbound messages to the plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    Hello {
        role: String,
        pid: u32,
    },
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Launcher {
        command: String,
        pid: u32,
        #[serde(rename = "gameId")]
        game_id: String,
    },
}

impl OutboundMessage {
    pub fn hello(role: &str) -> Self {
        OutboundMessage::Hello {
            role: role.to_string(),
            pid: std::process::id(),
        }
    }

    pub fn launch(id: &str) -> Self {
        OutboundMessage::Command {
            command: "launch".to_string(),
            id: Some(id.to_string()),
        }
    }

    pub fn stop(id: Option<&str>) -> Self {
        OutboundMessage::Command {
            command: "stop".to_string(),
            id: id.map(str::to_string),
        }
    }

    pub fn announce(game_id: &str) -> Self {
        OutboundMessage::Launcher {
            command: "announce".to_string(),
            pid: std::process::id(),
            game_id: game_id.to_string(),
        }
    }

    /// Encode as one NDJSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Reassembles newline-delimited JSON across arbitrary read chunks.
#[derive(Default)]
pub struct LineAccumulator {
    buffer: Vec<u8>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }
}

/// Parse one line, tolerating unknown message types by returning None.
pub fn parse_line(line: &str) -> Option<InboundMessage> {
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reassembles_split_lines() {
        let mut acc = LineAccumulator::new();
        assert!(acc.push(b"{\"type\":\"sta").is_empty());
        let lines = acc.push(b"tus\",\"name\":\"gameStarted\"}\n{\"type\":");
        assert_eq!(lines.len(), 1);

        let lines = acc.push(b"\"plugins\",\"plugins\":[]}\r\n");
        assert_eq!(lines.len(), 1);
        assert!(matches!(
            parse_line(&lines[0]),
            Some(InboundMessage::Plugins { .. })
        ));
    }

    #[test]
    fn status_message_parses() {
        let msg = parse_line(
            r#"{"type":"status","name":"gameStopped","id":"abc","exe":"g.exe","install_dir":"C:\\g"}"#,
        );
        match msg {
            Some(InboundMessage::Status { name, id, .. }) => {
                assert_eq!(name, "gameStopped");
                assert_eq!(id, "abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_types_and_fields_are_tolerated() {
        assert!(parse_line(r#"{"type":"future","x":1}"#).is_none());
        let msg = parse_line(r#"{"type":"games","games":[{"id":"g","extraField":true}]}"#);
        assert!(matches!(msg, Some(InboundMessage::Games { .. })));
    }

    #[test]
    fn outbound_lines_are_ndjson() {
        let line = OutboundMessage::launch("game-1").to_line();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["command"], "launch");
        assert_eq!(value["id"], "game-1");

        let hello: serde_json::Value =
            serde_json::from_str(OutboundMessage::hello("sunshine").to_line().trim()).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["role"], "sunshine");
    }

    #[test]
    fn game_fields_use_camel_case() {
        let game: PlayniteGame = serde_json::from_str(
            r#"{"id":"g1","name":"Game","lastPlayed":"2025-07-01T10:00:00Z","installed":true,
                "pluginId":"p1","workingDir":"C:\\games\\g1","boxArtPath":"art.png"}"#,
        )
        .unwrap();
        assert_eq!(game.last_played, "2025-07-01T10:00:00Z");
        assert_eq!(game.working_dir, "C:\\games\\g1");
    }
}
