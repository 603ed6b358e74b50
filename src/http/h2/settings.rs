//! HTTP/2 settings management
//!
//! This module implements SETTINGS parameters as defined in RFC 9113
//! Section 6.5, plus the bookkeeping for local settings that only take
//! effect once the peer acknowledges them.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Largest legal flow-control window and SETTINGS_INITIAL_WINDOW_SIZE
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Largest legal SETTINGS_MAX_FRAME_SIZE
pub const MAX_FRAME_SIZE_LIMIT: u32 = 0x00FF_FFFF;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
///
/// `None` means "not sent", in which case the protocol default applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// `None` = unlimited
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// `None` = unlimited
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Validate settings values
    ///
    /// An out-of-range window is a FLOW_CONTROL_ERROR, everything else a
    /// PROTOCOL_ERROR (RFC 9113 Section 6.5.2).
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size {
            if size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "initial window size {} exceeds 2^31-1",
                    size
                )));
            }
        }

        if let Some(size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&size) {
                return Err(Error::protocol(format!(
                    "max frame size {} outside 16384..=16777215",
                    size
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a SETTINGS payload; unknown parameters are ignored
    pub fn decode(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload of {} bytes is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        let mut buf = payload;
        while buf.has_remaining() {
            let id = buf.get_u16();
            let value = buf.get_u32();
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(SettingsParameter::EnablePush) => {
                    settings.enable_push = match value {
                        0 => Some(false),
                        1 => Some(true),
                        _ => return Err(Error::protocol(format!("ENABLE_PUSH value {}", value))),
                    }
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => log::trace!("ignoring unknown SETTINGS parameter 0x{:x}", id),
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Append the parameters that are set, 6 bytes each
    pub fn encode(&self, dst: &mut BytesMut) {
        let params = [
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, self.enable_push.map(u32::from)),
            (SettingsParameter::MaxConcurrentStreams, self.max_concurrent_streams),
            (SettingsParameter::InitialWindowSize, self.initial_window_size),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
            (SettingsParameter::MaxHeaderListSize, self.max_header_list_size),
        ];
        for (param, value) in params {
            if let Some(value) = value {
                dst.put_u16(param.as_u16());
                dst.put_u32(value);
            }
        }
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }
}

/// Builder for HTTP/2 settings
#[derive(Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// Local SETTINGS sent but not yet acknowledged
///
/// The peer acknowledges SETTINGS frames in the order they were sent, so
/// each ACK applies the oldest outstanding frame.
#[derive(Debug, Default)]
pub struct PendingSettings {
    queue: VecDeque<(Settings, Instant)>,
}

impl PendingSettings {
    pub fn new() -> Self {
        PendingSettings::default()
    }

    pub fn sent(&mut self, settings: Settings, at: Instant) {
        self.queue.push_back((settings, at));
    }

    /// Settings confirmed by an ACK, or `None` for an unsolicited ACK
    pub fn acknowledged(&mut self) -> Option<Settings> {
        self.queue.pop_front().map(|(settings, _)| settings)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the oldest outstanding frame has waited longer than `timeout`
    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.queue
            .front()
            .is_some_and(|(_, sent)| now.saturating_duration_since(*sent) > timeout)
    }
}
