//! WS-Management envelopes for the Windows Remote Shell resource.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use super::super::TransportError;

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS_REPLY: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const CMD_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const MAX_ENVELOPE_SIZE: u32 = 153_600;
const TERMINATE_SIGNAL: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const DONE_STATE_SUFFIX: &str = "CommandState/Done";

/// WS-Management fault raised when a Receive outlives the operation timeout
/// without output. The caller should simply poll again.
pub const OPERATION_TIMEOUT_FAULT: &str = "2150858793";

/// Shell actions used by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Open a shell.
    Create,
    /// Start a command in a shell.
    Command,
    /// Fetch pending output.
    Receive,
    /// Signal a running command.
    Signal,
    /// Close a shell.
    Delete,
}

impl Action {
    const fn uri(self) -> &'static str {
        match self {
            Self::Create => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Self::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Self::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Self::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
            Self::Delete => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
        }
    }
}

/// Header values shared by every request.
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeContext<'a> {
    /// Endpoint URL.
    pub endpoint: &'a str,
    /// Unique message identifier.
    pub message_id: &'a str,
    /// `OperationTimeout` in seconds.
    pub operation_timeout_secs: u64,
}

fn envelope(
    ctx: EnvelopeContext<'_>,
    action: Action,
    shell_id: Option<&str>,
    options: &str,
    body: &str,
) -> String {
    let selector = shell_id.map_or_else(String::new, |id| {
        format!(
            r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
            escape(id)
        )
    });
    format!(
        concat!(
            r#"<s:Envelope xmlns:s="{ns_soap}" xmlns:a="{ns_addr}" xmlns:w="{ns_wsman}" xmlns:rsp="{ns_shell}">"#,
            "<s:Header>",
            "<a:To>{to}</a:To>",
            r#"<a:ReplyTo><a:Address s:mustUnderstand="true">{reply}</a:Address></a:ReplyTo>"#,
            r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
            r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
            r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
            "<a:MessageID>uuid:{message_id}</a:MessageID>",
            r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
            "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
            "{selector}{options}",
            "</s:Header>",
            "<s:Body>{body}</s:Body>",
            "</s:Envelope>"
        ),
        ns_soap = NS_SOAP,
        ns_addr = NS_ADDRESSING,
        ns_wsman = NS_WSMAN,
        ns_shell = NS_SHELL,
        to = escape(ctx.endpoint),
        reply = ANONYMOUS_REPLY,
        resource = CMD_RESOURCE_URI,
        action = action.uri(),
        max = MAX_ENVELOPE_SIZE,
        message_id = ctx.message_id,
        timeout = ctx.operation_timeout_secs,
        selector = selector,
        options = options,
        body = body,
    )
}

/// Opens a `cmd` shell with UTF-8 output.
#[must_use]
pub fn create_shell(ctx: EnvelopeContext<'_>) -> String {
    let options = concat!(
        "<w:OptionSet>",
        r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#,
        r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#,
        "</w:OptionSet>"
    );
    let body = concat!(
        "<rsp:Shell>",
        "<rsp:InputStreams>stdin</rsp:InputStreams>",
        "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
        "</rsp:Shell>"
    );
    envelope(ctx, Action::Create, None, options, body)
}

/// Starts `command` in `shell_id`.
#[must_use]
pub fn run_command(ctx: EnvelopeContext<'_>, shell_id: &str, command: &str) -> String {
    let options = concat!(
        "<w:OptionSet>",
        r#"<w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
        r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>"#,
        "</w:OptionSet>"
    );
    let body = format!(
        "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
        escape(command)
    );
    envelope(ctx, Action::Command, Some(shell_id), options, &body)
}

/// Requests pending output of `command_id`.
#[must_use]
pub fn receive_output(ctx: EnvelopeContext<'_>, shell_id: &str, command_id: &str) -> String {
    let body = format!(
        r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
        escape(command_id)
    );
    envelope(ctx, Action::Receive, Some(shell_id), "", &body)
}

/// Terminates `command_id`.
#[must_use]
pub fn signal_terminate(ctx: EnvelopeContext<'_>, shell_id: &str, command_id: &str) -> String {
    let body = format!(
        r#"<rsp:Signal CommandId="{}"><rsp:Code>{TERMINATE_SIGNAL}</rsp:Code></rsp:Signal>"#,
        escape(command_id)
    );
    envelope(ctx, Action::Signal, Some(shell_id), "", &body)
}

/// Deletes `shell_id`.
#[must_use]
pub fn delete_shell(ctx: EnvelopeContext<'_>, shell_id: &str) -> String {
    envelope(ctx, Action::Delete, Some(shell_id), "", "")
}

/// Output decoded from one Receive response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReceiveChunk {
    /// Decoded stdout bytes.
    pub stdout: Vec<u8>,
    /// Decoded stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit code once the command is done.
    pub exit_code: Option<i32>,
    /// Whether the command has finished.
    pub done: bool,
}

/// SOAP fault details.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fault {
    /// WS-Management fault code, when present.
    pub code: Option<String>,
    /// Fault text.
    pub message: String,
}

impl Fault {
    /// Returns `true` for the benign Receive timeout.
    #[must_use]
    pub fn is_operation_timeout(&self) -> bool {
        self.code.as_deref() == Some(OPERATION_TIMEOUT_FAULT)
    }
}

impl From<Fault> for TransportError {
    fn from(value: Fault) -> Self {
        Self::Fault {
            code: value.code.unwrap_or_else(|| String::from("unknown")),
            message: value.message,
        }
    }
}

fn reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader
}

fn protocol_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(err.to_string())
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, TransportError> {
    for entry in element.attributes() {
        let attr = entry.map_err(protocol_error)?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value().map_err(protocol_error)?.into_owned()));
        }
    }
    Ok(None)
}

/// Returns the text of the first element whose local name is `name`.
fn first_text(xml: &str, name: &[u8]) -> Result<Option<String>, TransportError> {
    let mut reader = reader(xml);
    let mut inside = false;
    loop {
        match reader.read_event().map_err(protocol_error)? {
            Event::Start(element) if element.local_name().as_ref() == name => inside = true,
            Event::Text(text) if inside => {
                return Ok(Some(text.unescape().map_err(protocol_error)?.into_owned()));
            }
            Event::End(element) if element.local_name().as_ref() == name => inside = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Extracts the shell identifier from a Create response.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] when the response carries none.
pub fn parse_shell_id(xml: &str) -> Result<String, TransportError> {
    if let Some(id) = first_text(xml, b"ShellId")? {
        return Ok(id);
    }
    let mut reader = reader(xml);
    let mut in_shell_selector = false;
    loop {
        match reader.read_event().map_err(protocol_error)? {
            Event::Start(element) if element.local_name().as_ref() == b"Selector" => {
                in_shell_selector = attribute(&element, b"Name")?.as_deref() == Some("ShellId");
            }
            Event::Text(text) if in_shell_selector => {
                return Ok(text.unescape().map_err(protocol_error)?.into_owned());
            }
            Event::End(_) => in_shell_selector = false,
            Event::Eof => {
                return Err(TransportError::Protocol(String::from(
                    "create response carried no shell id",
                )));
            }
            _ => {}
        }
    }
}

/// Extracts the command identifier from a Command response.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] when the response carries none.
pub fn parse_command_id(xml: &str) -> Result<String, TransportError> {
    first_text(xml, b"CommandId")?.ok_or_else(|| {
        TransportError::Protocol(String::from("command response carried no command id"))
    })
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum StreamName {
    Stdout,
    Stderr,
}

/// Decodes the streams and command state of a Receive response.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] for malformed XML, base64, or exit
/// codes.
pub fn parse_receive(xml: &str) -> Result<ReceiveChunk, TransportError> {
    let mut reader = reader(xml);
    let mut chunk = ReceiveChunk::default();
    let mut stream: Option<StreamName> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event().map_err(protocol_error)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"Stream" => {
                    stream = match attribute(&element, b"Name")?.as_deref() {
                        Some("stdout") => Some(StreamName::Stdout),
                        Some("stderr") => Some(StreamName::Stderr),
                        _ => None,
                    };
                }
                b"CommandState" => {
                    chunk.done |= is_done_state(&element)?;
                }
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"CommandState" => {
                chunk.done |= is_done_state(&element)?;
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(protocol_error)?;
                if let Some(name) = stream {
                    let decoded = STANDARD.decode(value.trim()).map_err(protocol_error)?;
                    match name {
                        StreamName::Stdout => chunk.stdout.extend_from_slice(&decoded),
                        StreamName::Stderr => chunk.stderr.extend_from_slice(&decoded),
                    }
                } else if in_exit_code {
                    let raw = value.trim().parse::<i64>().map_err(protocol_error)?;
                    chunk.exit_code = Some(exit_code_from_wire(raw)?);
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"Stream" => stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Event::Eof => return Ok(chunk),
            _ => {}
        }
    }
}

/// Windows reports exit codes as unsigned 32-bit values; keep the bit
/// pattern so `0xC0000005` reads as a negative `i32`.
fn exit_code_from_wire(raw: i64) -> Result<i32, TransportError> {
    let signed = if raw > i64::from(i32::MAX) {
        raw - (1_i64 << 32)
    } else {
        raw
    };
    i32::try_from(signed).map_err(protocol_error)
}

fn is_done_state(element: &BytesStart<'_>) -> Result<bool, TransportError> {
    Ok(attribute(element, b"State")?.is_some_and(|state| state.ends_with(DONE_STATE_SUFFIX)))
}

/// Extracts fault details from an error response.
///
/// Unparsable bodies become a fault with the raw text as its message.
#[must_use]
pub fn parse_fault(xml: &str) -> Fault {
    let mut fault = Fault::default();
    let mut reader = reader(xml);
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element) | Event::Empty(element))
                if element.local_name().as_ref() == b"WSManFault" =>
            {
                fault.code = attribute(&element, b"Code").ok().flatten();
            }
            Ok(Event::Start(element))
                if matches!(element.local_name().as_ref(), b"Text" | b"Message") =>
            {
                in_text = true;
            }
            Ok(Event::Text(text)) if in_text && fault.message.is_empty() => {
                if let Ok(value) = text.unescape() {
                    fault.message = value.trim().to_owned();
                }
            }
            Ok(Event::End(_)) => in_text = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    if fault.message.is_empty() {
        fault.message = xml.trim().to_owned();
    }
    fault
}
