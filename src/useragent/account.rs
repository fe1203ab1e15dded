use super::media::{
    find_audio_codec, find_media_encryption, find_media_nat, AudioCodec, MediaPlugin, VideoCodec,
    AUDIO_CODECS, VIDEO_CODECS,
};
use super::stun::{StunUri, StunUriError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

pub const MAX_OUTBOUND: usize = 2;
pub const MAX_AUDIO_CODECS: usize = 8;
pub const MAX_VIDEO_CODECS: usize = 4;

const REG_INTERVAL: u32 = 3600;
const DEFAULT_PTIME: u32 = 20;
const DEFAULT_SAMPLE_RATE: u32 = 8000;
const DEFAULT_CHANNELS: u8 = 1;

/// `name/rate[/channels]`
static CODEC_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^/]+)/([0-9]+)(?:/([0-9]*))?$").expect("valid codec pattern"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid SIP address: {0}")]
    InvalidAddress(String),
    #[error("unknown sipnat value: `{0}`")]
    InvalidSipNat(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("outbound proxy index {0} out of range")]
    OutboundIndex(usize),
    #[error("unknown sipnat value: `{0}`")]
    InvalidSipNat(String),
    #[error("medianat not found: `{0}`")]
    UnknownMediaNat(String),
    #[error("mediaenc not found: `{0}`")]
    UnknownMediaEncryption(String),
    #[error("invalid STUN host: `{0}`")]
    InvalidStunHost(String),
    #[error(transparent)]
    StunUri(#[from] StunUriError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    #[default]
    Manual,
    Early,
    Auto,
}

impl FromStr for AnswerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("manual") {
            Ok(AnswerMode::Manual)
        } else if s.eq_ignore_ascii_case("early") {
            Ok(AnswerMode::Early)
        } else if s.eq_ignore_ascii_case("auto") {
            Ok(AnswerMode::Auto)
        } else {
            Err(s.to_string())
        }
    }
}

impl fmt::Display for AnswerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnswerMode::Manual => "manual",
            AnswerMode::Early => "early",
            AnswerMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authentication {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// A media plugin id together with the registry entry it resolved to.
/// Unresolved ids are kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRef {
    pub id: String,
    pub plugin: Option<&'static MediaPlugin>,
}

impl PluginRef {
    pub fn is_resolved(&self) -> bool {
        self.plugin.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StunSettings {
    pub server: Option<StunUri>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeIssue {
    pub field: &'static str,
    pub issue: String,
}

impl fmt::Display for DecodeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.issue)
    }
}

/// Degraded-but-successful decode results. Every entry is also logged.
#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    issues: Vec<DecodeIssue>,
}

impl DecodeReport {
    fn warn(&mut self, field: &'static str, issue: String) {
        warn!(field, "account: {}", issue);
        self.issues.push(DecodeIssue { field, issue });
    }

    pub fn issues(&self) -> &[DecodeIssue] {
        &self.issues
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_issue(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

#[derive(Debug, Clone)]
pub struct DecodedAccount {
    pub account: Account,
    pub report: DecodeReport,
}

/// Decoded configuration of one SIP identity.
#[derive(Debug, Clone)]
pub struct Account {
    source: String,
    uri: rsip::Uri,
    aor: String,
    display_name: Option<String>,
    authentication: Authentication,
    outbound: [Option<String>; MAX_OUTBOUND],
    sip_nat: Option<String>,
    registration_interval: u32,
    publish_interval: u32,
    registration_queue: Option<String>,
    answer_mode: AnswerMode,
    audio_codecs: Vec<&'static AudioCodec>,
    video_codecs: Vec<&'static VideoCodec>,
    media_encryption: Option<PluginRef>,
    media_nat: Option<PluginRef>,
    rtp_keepalive: Option<String>,
    packet_time: u32,
    stun: Option<StunSettings>,
}

struct AddressParams(Vec<(String, Option<String>)>);

impl AddressParams {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    fn dstr(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    fn u32(&self, name: &'static str, report: &mut DecodeReport) -> Option<u32> {
        let value = self.get(name)?;
        match value.parse::<u32>() {
            Ok(v) => Some(v),
            Err(_) => {
                report.warn(name, format!("invalid number `{}`", value));
                None
            }
        }
    }
}

struct NameAddr {
    display_name: Option<String>,
    uri: rsip::Uri,
    params: AddressParams,
}

/// Reads a quoted string body (after the opening quote), returning the
/// unescaped value and the remainder after the closing quote.
fn parse_quoted(s: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some((value, &s[i + 1..]));
        } else {
            value.push(c);
        }
    }
    None
}

fn parse_params(s: &str) -> Option<AddressParams> {
    let mut params = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        rest = rest.strip_prefix(';')?.trim_start();
        if rest.is_empty() {
            break;
        }
        let name_end = rest.find(['=', ';']).unwrap_or(rest.len());
        let name = rest[..name_end].trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        rest = &rest[name_end..];
        let value = match rest.strip_prefix('=') {
            Some(v) => {
                let v = v.trim_start();
                if let Some(quoted) = v.strip_prefix('"') {
                    let (value, tail) = parse_quoted(quoted)?;
                    rest = tail.trim_start();
                    Some(value)
                } else {
                    let end = v.find(';').unwrap_or(v.len());
                    rest = &v[end..];
                    Some(v[..end].trim().to_string())
                }
            }
            None => None,
        };
        params.push((name.to_string(), value));
    }
    Some(AddressParams(params))
}

fn parse_uri(s: &str) -> Result<rsip::Uri, DecodeError> {
    let invalid = || DecodeError::InvalidAddress(s.to_string());
    let (scheme, body) = s.split_once(':').ok_or_else(invalid)?;
    if !scheme.eq_ignore_ascii_case("sip") && !scheme.eq_ignore_ascii_case("sips") {
        return Err(invalid());
    }
    if s.chars()
        .any(|c| c.is_whitespace() || c == '<' || c == '>' || c == '"')
    {
        return Err(invalid());
    }
    let hostpart_end = body.find([';', '?']).unwrap_or(body.len());
    let (hostpart, tail) = body.split_at(hostpart_end);
    // userinfo is split here: rsip rejects passwords it mistakes for ports
    let (auth, host) = match hostpart.rsplit_once('@') {
        Some((userinfo, host)) => {
            let (user, password) = match userinfo.split_once(':') {
                Some((user, password)) => (user, Some(password.to_string())),
                None => (userinfo, None),
            };
            if user.is_empty() {
                return Err(invalid());
            }
            let auth = rsip::Auth {
                user: user.to_string(),
                password,
            };
            (Some(auth), host)
        }
        None => (None, hostpart),
    };
    if host.is_empty() || host.starts_with(':') {
        return Err(invalid());
    }
    let bare = format!("{}:{}{}", scheme, host, tail);
    let mut uri = rsip::Uri::try_from(bare.as_str())
        .map_err(|e| DecodeError::InvalidAddress(format!("{}: {}", s, e)))?;
    uri.auth = auth;
    Ok(uri)
}

fn parse_name_addr(input: &str) -> Result<NameAddr, DecodeError> {
    let input = input.trim();
    let invalid = || DecodeError::InvalidAddress(input.to_string());

    match input.find('<') {
        Some(lt) => {
            let display = input[..lt].trim();
            let display_name = if let Some(quoted) = display.strip_prefix('"') {
                let (name, tail) = parse_quoted(quoted).ok_or_else(invalid)?;
                if !tail.trim().is_empty() {
                    return Err(invalid());
                }
                Some(name)
            } else if display.contains('"') {
                return Err(invalid());
            } else {
                Some(display.to_string())
            };
            let gt = input[lt..].find('>').ok_or_else(invalid)? + lt;
            let uri = parse_uri(&input[lt + 1..gt])?;
            let params = parse_params(&input[gt + 1..]).ok_or_else(invalid)?;
            Ok(NameAddr {
                display_name: display_name.filter(|n| !n.is_empty()),
                uri,
                params,
            })
        }
        None => {
            // addr-spec without angle brackets: parameters belong to the address
            let (uri, params) = match input.find(';') {
                Some(idx) => (&input[..idx], &input[idx..]),
                None => (input, ""),
            };
            Ok(NameAddr {
                display_name: None,
                uri: parse_uri(uri)?,
                params: parse_params(params).ok_or_else(invalid)?,
            })
        }
    }
}

fn split_codec_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn decode_audio_codecs(params: &AddressParams, report: &mut DecodeReport) -> Vec<&'static AudioCodec> {
    let mut codecs = Vec::new();
    let list = match params.get("audio_codecs") {
        Some(list) => list,
        None => return codecs,
    };
    for token in split_codec_list(list) {
        if codecs.len() >= MAX_AUDIO_CODECS {
            report.warn(
                "audio_codecs",
                format!("more than {} codecs, `{}` ignored", MAX_AUDIO_CODECS, token),
            );
            break;
        }
        let (name, sample_rate, channels) = match CODEC_TOKEN.captures(token) {
            Some(caps) => {
                let rate = caps[2].parse::<u32>().ok();
                let ch = match caps.get(3).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                    Some(ch) => ch.parse::<u8>().ok(),
                    None => Some(DEFAULT_CHANNELS),
                };
                match (rate, ch) {
                    (Some(rate), Some(ch)) => (caps[1].to_string(), rate, ch),
                    _ => {
                        report.warn("audio_codecs", format!("malformed codec `{}`", token));
                        continue;
                    }
                }
            }
            None => (token.to_string(), DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS),
        };
        match find_audio_codec(&name, sample_rate, channels) {
            Some(codec) => codecs.push(codec),
            None => report.warn(
                "audio_codecs",
                format!("audio codec not found: {}/{}/{}", name, sample_rate, channels),
            ),
        }
    }
    codecs
}

#[cfg(feature = "video")]
fn decode_video_codecs(params: &AddressParams, report: &mut DecodeReport) -> Vec<&'static VideoCodec> {
    let mut codecs = Vec::new();
    let list = match params.get("video_codecs") {
        Some(list) => list,
        None => return codecs,
    };
    for token in split_codec_list(list) {
        if codecs.len() >= MAX_VIDEO_CODECS {
            report.warn(
                "video_codecs",
                format!("more than {} codecs, `{}` ignored", MAX_VIDEO_CODECS, token),
            );
            break;
        }
        match super::media::find_video_codec(token) {
            Some(codec) => codecs.push(codec),
            None => report.warn("video_codecs", format!("video codec not found: {}", token)),
        }
    }
    codecs
}

impl Account {
    /// Decodes `[display-name] <sip:user[:password]@host[:port]>[;param=value]*`.
    ///
    /// Only a malformed address or an unsupported `sipnat` value fail the
    /// decode; everything else degrades into the returned report.
    pub fn decode(input: &str) -> Result<DecodedAccount, DecodeError> {
        let source = input.to_string();
        let addr = match parse_name_addr(&source) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("account: invalid SIP address: `{}`", source.trim());
                return Err(e);
            }
        };
        let mut report = DecodeReport::default();
        let params = &addr.params;

        let mut luri = addr.uri.clone();
        if let Some(auth) = luri.auth.as_mut() {
            auth.password = None;
        }
        luri.params.clear();
        luri.headers.clear();
        let aor = luri.to_string();

        let uri_user = addr.uri.auth.as_ref().map(|a| a.user.clone());
        let uri_password = addr.uri.auth.as_ref().and_then(|a| a.password.clone());

        let registration_interval = params
            .u32("regint", &mut report)
            .unwrap_or_else(|| REG_INTERVAL + (rand::random::<u32>() & 0xff));
        let publish_interval = params.u32("pubint", &mut report).unwrap_or(0);
        let registration_queue = params.dstr("regq");

        let mut outbound: [Option<String>; MAX_OUTBOUND] = Default::default();
        for (i, slot) in outbound.iter_mut().enumerate() {
            *slot = params.dstr(&format!("outbound{}", i + 1));
        }
        if outbound[0].is_none() {
            outbound[0] = params.dstr("outbound");
        }

        let sip_nat = match params.get("sipnat") {
            Some(v) if v.is_empty() => None,
            Some(v) if v.eq_ignore_ascii_case("outbound") => Some(v.to_string()),
            Some(v) => {
                warn!("account: unknown sipnat value: '{}'", v);
                return Err(DecodeError::InvalidSipNat(v.to_string()));
            }
            None => None,
        };

        let authentication = Authentication {
            user: params.dstr("auth_user").or(uri_user),
            password: uri_password,
        };

        let answer_mode = match params.get("answermode") {
            Some(mode) => mode.parse::<AnswerMode>().unwrap_or_else(|unknown| {
                report.warn("answermode", format!("answermode unknown ({})", unknown));
                AnswerMode::Manual
            }),
            None => AnswerMode::Manual,
        };

        let audio_codecs = decode_audio_codecs(params, &mut report);
        #[cfg(feature = "video")]
        let video_codecs = decode_video_codecs(params, &mut report);
        #[cfg(not(feature = "video"))]
        let video_codecs = Vec::new();

        let media_encryption_id = params.dstr("mediaenc").filter(|s| !s.is_empty());
        let media_nat_id = params.dstr("medianat").filter(|s| !s.is_empty());
        let rtp_keepalive = params.dstr("rtpkeep");
        let packet_time = params.u32("ptime", &mut report).unwrap_or(DEFAULT_PTIME);

        if authentication.password.is_none() {
            report.warn(
                "password",
                format!("no password for {}", addr.uri.host_with_port),
            );
        }

        let mut stun = None;
        let media_nat = media_nat_id.map(|id| {
            let mut settings = StunSettings::default();
            if let Some(server) = params.get("stunserver") {
                match server.parse::<StunUri>() {
                    Ok(uri) => settings.server = Some(uri),
                    Err(e) => report.warn("stunserver", format!("decode '{}' failed: {}", server, e)),
                }
            }
            settings.user = params.dstr("stunuser");
            settings.password = params.dstr("stunpass");
            stun = Some(settings);

            let plugin = find_media_nat(&id);
            if plugin.is_none() {
                report.warn("medianat", format!("medianat not found: `{}`", id));
            }
            PluginRef { id, plugin }
        });

        let media_encryption = media_encryption_id.map(|id| {
            let plugin = find_media_encryption(&id);
            if plugin.is_none() {
                report.warn("mediaenc", format!("mediaenc not found: `{}`", id));
            }
            PluginRef { id, plugin }
        });

        let account = Account {
            source,
            uri: addr.uri,
            aor,
            display_name: addr.display_name,
            authentication,
            outbound,
            sip_nat,
            registration_interval,
            publish_interval,
            registration_queue,
            answer_mode,
            audio_codecs,
            video_codecs,
            media_encryption,
            media_nat,
            rtp_keepalive,
            packet_time,
            stun,
        };
        Ok(DecodedAccount { account, report })
    }

    /// The string this account was decoded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The decoded address URI, password included.
    pub fn uri(&self) -> &rsip::Uri {
        &self.uri
    }

    /// Canonical address-of-record: no password, no URI parameters or headers.
    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn user(&self) -> Option<&str> {
        self.uri.auth.as_ref().map(|a| a.user.as_str())
    }

    pub fn host(&self) -> String {
        self.uri.host_with_port.to_string()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    pub fn outbound(&self, ix: usize) -> Option<&str> {
        self.outbound.get(ix).and_then(|o| o.as_deref())
    }

    pub fn outbound_proxies(&self) -> impl Iterator<Item = &str> {
        self.outbound.iter().filter_map(|o| o.as_deref())
    }

    pub fn sip_nat(&self) -> Option<&str> {
        self.sip_nat.as_deref()
    }

    pub fn registration_interval(&self) -> u32 {
        self.registration_interval
    }

    pub fn publish_interval(&self) -> u32 {
        self.publish_interval
    }

    pub fn registration_queue(&self) -> Option<&str> {
        self.registration_queue.as_deref()
    }

    pub fn answer_mode(&self) -> AnswerMode {
        self.answer_mode
    }

    pub fn audio_codecs(&self) -> &[&'static AudioCodec] {
        &self.audio_codecs
    }

    /// Codecs to offer: the account list, or every known codec when empty.
    pub fn audio_codec_list(&self) -> Vec<&'static AudioCodec> {
        if self.audio_codecs.is_empty() {
            AUDIO_CODECS.iter().collect()
        } else {
            self.audio_codecs.clone()
        }
    }

    pub fn video_codecs(&self) -> &[&'static VideoCodec] {
        &self.video_codecs
    }

    pub fn video_codec_list(&self) -> Vec<&'static VideoCodec> {
        if self.video_codecs.is_empty() {
            VIDEO_CODECS.iter().collect()
        } else {
            self.video_codecs.clone()
        }
    }

    pub fn media_encryption(&self) -> Option<&PluginRef> {
        self.media_encryption.as_ref()
    }

    pub fn media_nat(&self) -> Option<&PluginRef> {
        self.media_nat.as_ref()
    }

    pub fn rtp_keepalive(&self) -> Option<&str> {
        self.rtp_keepalive.as_deref()
    }

    pub fn packet_time(&self) -> u32 {
        self.packet_time
    }

    pub fn stun(&self) -> Option<&StunSettings> {
        self.stun.as_ref()
    }

    pub fn stun_uri(&self) -> Option<&StunUri> {
        self.stun.as_ref().and_then(|s| s.server.as_ref())
    }

    pub fn stun_host(&self) -> Option<&str> {
        self.stun_uri().map(|u| u.host.as_str())
    }

    pub fn stun_port(&self) -> u16 {
        self.stun_uri().map(|u| u.port).unwrap_or(0)
    }

    pub fn stun_user(&self) -> Option<&str> {
        self.stun.as_ref().and_then(|s| s.user.as_deref())
    }

    pub fn stun_password(&self) -> Option<&str> {
        self.stun.as_ref().and_then(|s| s.password.as_deref())
    }

    pub fn set_auth_user(&mut self, user: Option<&str>) {
        self.authentication.user = user.map(|s| s.to_string());
    }

    pub fn set_auth_password(&mut self, password: Option<&str>) {
        self.authentication.password = password.map(|s| s.to_string());
    }

    pub fn set_outbound(&mut self, outbound: Option<&str>, ix: usize) -> Result<(), AccountError> {
        let slot = self
            .outbound
            .get_mut(ix)
            .ok_or(AccountError::OutboundIndex(ix))?;
        *slot = outbound.map(|s| s.to_string());
        Ok(())
    }

    pub fn set_sip_nat(&mut self, sip_nat: Option<&str>) -> Result<(), AccountError> {
        match sip_nat {
            Some(v) if v.eq_ignore_ascii_case("outbound") => {
                self.sip_nat = Some(v.to_string());
                Ok(())
            }
            Some(v) => {
                warn!("account: unknown sipnat value: '{}'", v);
                Err(AccountError::InvalidSipNat(v.to_string()))
            }
            None => {
                self.sip_nat = None;
                Ok(())
            }
        }
    }

    pub fn set_display_name(&mut self, name: Option<&str>) {
        self.display_name = name.map(|s| s.to_string());
    }

    pub fn set_registration_interval(&mut self, seconds: u32) {
        self.registration_interval = seconds;
    }

    pub fn set_answer_mode(&mut self, mode: AnswerMode) {
        self.answer_mode = mode;
    }

    /// Replaces the STUN server. On a parse error the previous server is kept.
    pub fn set_stun_uri(&mut self, uri: Option<&str>) -> Result<(), AccountError> {
        let server = match uri {
            Some(uri) => Some(uri.parse::<StunUri>().map_err(|e| {
                warn!("account: decode '{}' failed: {}", uri, e);
                e
            })?),
            None => None,
        };
        match (&mut self.stun, server) {
            (Some(stun), server) => stun.server = server,
            (None, Some(server)) => {
                self.stun = Some(StunSettings {
                    server: Some(server),
                    ..Default::default()
                })
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// No-op when no STUN server is configured.
    pub fn set_stun_host(&mut self, host: &str) -> Result<(), AccountError> {
        if let Some(server) = self.stun.as_mut().and_then(|s| s.server.as_mut()) {
            if host.is_empty() || host.contains(char::is_whitespace) {
                return Err(AccountError::InvalidStunHost(host.to_string()));
            }
            server.host = host.to_string();
        }
        Ok(())
    }

    pub fn set_stun_port(&mut self, port: u16) {
        if let Some(server) = self.stun.as_mut().and_then(|s| s.server.as_mut()) {
            server.port = port;
        }
    }

    pub fn set_stun_user(&mut self, user: Option<&str>) {
        self.stun.get_or_insert_with(Default::default).user = user.map(|s| s.to_string());
    }

    pub fn set_stun_password(&mut self, password: Option<&str>) {
        self.stun.get_or_insert_with(Default::default).password = password.map(|s| s.to_string());
    }

    /// Selects a media encryption plugin; unknown ids are rejected and the
    /// current setting is kept.
    pub fn set_media_encryption(&mut self, id: Option<&str>) -> Result<(), AccountError> {
        self.media_encryption = match id {
            Some(id) => {
                let plugin = find_media_encryption(id).ok_or_else(|| {
                    warn!("account: mediaenc not found: `{}`", id);
                    AccountError::UnknownMediaEncryption(id.to_string())
                })?;
                Some(PluginRef {
                    id: id.to_string(),
                    plugin: Some(plugin),
                })
            }
            None => None,
        };
        Ok(())
    }

    pub fn set_media_nat(&mut self, id: Option<&str>) -> Result<(), AccountError> {
        self.media_nat = match id {
            Some(id) => {
                let plugin = find_media_nat(id).ok_or_else(|| {
                    warn!("account: medianat not found: `{}`", id);
                    AccountError::UnknownMediaNat(id.to_string())
                })?;
                Some(PluginRef {
                    id: id.to_string(),
                    plugin: Some(plugin),
                })
            }
            None => None,
        };
        Ok(())
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_none(v: Option<&str>) -> &str {
            v.unwrap_or("none")
        }
        writeln!(f, "Account:")?;
        writeln!(f, " aor:          {}", self.aor)?;
        writeln!(f, " dispname:     {}", or_none(self.display_name()))?;
        writeln!(f, " answermode:   {}", self.answer_mode)?;
        if !self.audio_codecs.is_empty() {
            write!(f, " audio_codecs:")?;
            for codec in &self.audio_codecs {
                write!(f, " {}", codec)?;
            }
            writeln!(f)?;
        }
        writeln!(f, " auth_user:    {}", or_none(self.authentication.user.as_deref()))?;
        writeln!(
            f,
            " mediaenc:     {}",
            or_none(self.media_encryption.as_ref().map(|m| m.id.as_str()))
        )?;
        writeln!(
            f,
            " medianat:     {}",
            or_none(self.media_nat.as_ref().map(|m| m.id.as_str()))
        )?;
        for (i, outbound) in self.outbound.iter().enumerate() {
            if let Some(outbound) = outbound {
                writeln!(f, " outbound{}:    {}", i + 1, outbound)?;
            }
        }
        writeln!(f, " ptime:        {}", self.packet_time)?;
        writeln!(f, " regint:       {}", self.registration_interval)?;
        writeln!(f, " pubint:       {}", self.publish_interval)?;
        writeln!(f, " regq:         {}", or_none(self.registration_queue()))?;
        writeln!(f, " rtpkeep:      {}", or_none(self.rtp_keepalive()))?;
        writeln!(f, " sipnat:       {}", or_none(self.sip_nat()))?;
        writeln!(f, " stunuser:     {}", or_none(self.stun_user()))?;
        match self.stun_uri() {
            Some(uri) => writeln!(f, " stunserver:   {}", uri)?,
            None => writeln!(f, " stunserver:   none")?,
        }
        if !self.video_codecs.is_empty() {
            write!(f, " video_codecs:")?;
            for codec in &self.video_codecs {
                write!(f, " {}", codec)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
