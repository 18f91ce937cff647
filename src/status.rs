//! Pure projections from client state to the texts shown to the user.

use derive_more::Display;
use std::time::Duration;

use crate::call::{CallState, EndReason, Snapshot};
use crate::signaling::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StatusColor {
    #[display(fmt = "green")]
    Green,
    #[display(fmt = "yellow")]
    Yellow,
    #[display(fmt = "red")]
    Red,
    #[display(fmt = "blue")]
    Blue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    /// the connection line, e.g. "Connected: Connected to Peer Server"
    pub status_text: String,
    pub status_color: StatusColor,
    /// the line under the dialer, e.g. "Calling bob@example.com..."
    pub call_status: String,
    /// `call_status` describes a failure
    pub is_error: bool,
}

pub fn project(snapshot: &Snapshot) -> StatusView {
    let remote = snapshot
        .remote
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_default();
    let (mut status_text, mut status_color) = channel_line(snapshot.channel);
    let mut is_error = matches!(snapshot.channel, ChannelStatus::Failed(_));

    let call_status = match snapshot.state {
        CallState::Idle => match snapshot.channel {
            ChannelStatus::Connected => "Ready to make calls".to_owned(),
            ChannelStatus::Offline => "Not logged in".to_owned(),
            _ => "Not connected".to_owned(),
        },
        CallState::Dialing => {
            status_text = "Connecting...".to_owned();
            status_color = StatusColor::Yellow;
            format!("Calling {}...", remote)
        }
        CallState::RingingInbound => {
            let label = snapshot.kind.map(|k| k.call_label()).unwrap_or("Call");
            format!("Incoming {} from {}", label, remote)
        }
        CallState::Connecting => format!("Connecting to {}...", remote),
        CallState::Active => {
            status_text = format!("In Call: Connected to {}", remote);
            status_color = StatusColor::Blue;
            "Call connected".to_owned()
        }
        CallState::Ending => "Ending call...".to_owned(),
        CallState::Ended => {
            if snapshot.channel == ChannelStatus::Connected {
                status_text = "Connected: Ready for calls".to_owned();
            }
            match snapshot.end_reason {
                Some(EndReason::Rejected) => "Call rejected".to_owned(),
                Some(EndReason::Missed) => format!("Missed call from {}", remote),
                Some(EndReason::Failed) => {
                    is_error = true;
                    "Call error occurred".to_owned()
                }
                _ => "Call ended".to_owned(),
            }
        }
    };

    StatusView {
        status_text,
        status_color,
        call_status,
        is_error,
    }
}

fn channel_line(status: ChannelStatus) -> (String, StatusColor) {
    match status {
        ChannelStatus::Offline => ("Disconnected".to_owned(), StatusColor::Red),
        ChannelStatus::Connecting | ChannelStatus::Reconnecting => {
            ("Connecting...".to_owned(), StatusColor::Yellow)
        }
        ChannelStatus::Connected => (
            "Connected: Connected to Peer Server".to_owned(),
            StatusColor::Green,
        ),
        ChannelStatus::Disconnected => (
            "Disconnected: Disconnected from server".to_owned(),
            StatusColor::Red,
        ),
        ChannelStatus::Failed(e) => (format!("Error: {}", e), StatusColor::Red),
    }
}

/// "MM:SS"; minutes keep counting past an hour
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// text and color of a microphone or camera indicator
pub fn media_indicator(enabled: bool) -> (&'static str, StatusColor) {
    if enabled {
        ("On", StatusColor::Green)
    } else {
        ("Off", StatusColor::Red)
    }
}
