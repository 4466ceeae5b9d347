//! Print session orchestration: lifecycle phases, mandated command timing
//! and the shared device state written by the notification pump.
//!
//! A session drives exactly one physical printer. Frames go out one at a
//! time; after each write the session waits the delay the firmware mandates
//! for that command kind before sending the next. Shortening those waits is
//! a correctness bug, not an optimization opportunity: the device locks up
//! without reporting anything.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, pin_mut};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PrinterError;
use crate::plan::{LineOp, Plan, collapse_blank_runs};
use crate::protocol::{self, LegacyCommand, NextGenCommand, ProtocolFamily};
use crate::raster::{self, Bitmap, LineMode};

/// Write primitives supplied by the host. `write_data` only matters for the
/// next-gen family; it defaults to the command channel for devices with a
/// single write characteristic.
#[async_trait]
pub trait Transport: Send {
    async fn write_command(&mut self, bytes: &[u8]) -> Result<(), PrinterError>;

    async fn write_data(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        self.write_command(bytes).await
    }
}

/// Time source for mandated delays. Tests substitute a recording fake so
/// scheduling discipline is asserted without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Lifecycle of one print session. Phases cycle in order; none is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Configuring,
    Printing,
    Finishing,
}

/// Last known device status, updated by the notification pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    pub battery_level: u8,
    pub has_paper: bool,
    pub temperature: Option<u8>,
    pub session_phase: SessionPhase,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            battery_level: 0,
            has_paper: true,
            temperature: None,
            session_phase: SessionPhase::Idle,
        }
    }
}

/// Shared handle to [`DeviceState`]. The notification pump is the only
/// writer of battery/paper/temperature; the session only writes the phase.
#[derive(Debug, Clone, Default)]
pub struct DeviceStateHandle {
    inner: Arc<Mutex<DeviceState>>,
}

impl DeviceStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> DeviceState {
        *self.inner.lock().await
    }

    async fn set_phase(&self, phase: SessionPhase) {
        self.inner.lock().await.session_phase = phase;
    }

    async fn apply(&self, update: protocol::StatusUpdate) {
        let mut state = self.inner.lock().await;
        match update {
            protocol::StatusUpdate::Status {
                has_paper,
                battery,
                temperature,
            } => {
                state.has_paper = has_paper;
                if let Some(level) = battery {
                    state.battery_level = level;
                }
                if let Some(temp) = temperature {
                    state.temperature = Some(temp);
                }
            }
            protocol::StatusUpdate::Battery(level) => state.battery_level = level,
            protocol::StatusUpdate::PrintComplete => {
                debug!("device reported print complete");
            }
        }
    }
}

/// Feeds raw notification frames into the shared state until the stream
/// ends. Runs concurrently with the outgoing command stream; malformed or
/// unknown frames are dropped inside the decoder.
pub async fn pump_notifications<S>(
    family: ProtocolFamily,
    stream: S,
    handle: DeviceStateHandle,
) where
    S: Stream<Item = Vec<u8>> + Send,
{
    pin_mut!(stream);
    while let Some(raw) = stream.next().await {
        if let Some(update) = protocol::decode(family, &raw) {
            debug!(?update, "device notification");
            handle.apply(update).await;
        }
    }
    debug!("notification stream ended");
}

/// Logical command kinds, the key of the mandated delay table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Configure,
    BeginPrint,
    DrawLine,
    DataChunk,
    Feed,
    Retract,
    EndPrint,
    Query,
}

/// Minimum post-write delay per family and command kind. Kept as data so the
/// scheduling contract is inspectable and testable against a fake clock.
/// The 30/200 ms next-gen values come from the deployed firmware; the GB
/// values are the conservative ones its firmware tolerates.
pub fn mandated_delay(family: ProtocolFamily, kind: CommandKind) -> Duration {
    let ms = match (family, kind) {
        (ProtocolFamily::Legacy, CommandKind::Configure) => 20,
        (ProtocolFamily::Legacy, CommandKind::BeginPrint) => 100,
        (ProtocolFamily::Legacy, CommandKind::DrawLine) => 20,
        (ProtocolFamily::Legacy, CommandKind::DataChunk) => 20,
        (ProtocolFamily::Legacy, CommandKind::Feed) => 20,
        (ProtocolFamily::Legacy, CommandKind::Retract) => 20,
        (ProtocolFamily::Legacy, CommandKind::EndPrint) => 200,
        (ProtocolFamily::Legacy, CommandKind::Query) => 0,
        (ProtocolFamily::NextGen, CommandKind::Configure) => 30,
        (ProtocolFamily::NextGen, CommandKind::BeginPrint) => 200,
        (ProtocolFamily::NextGen, CommandKind::DrawLine) => 30,
        (ProtocolFamily::NextGen, CommandKind::DataChunk) => 30,
        (ProtocolFamily::NextGen, CommandKind::Feed) => 30,
        (ProtocolFamily::NextGen, CommandKind::Retract) => 30,
        (ProtocolFamily::NextGen, CommandKind::EndPrint) => 200,
        (ProtocolFamily::NextGen, CommandKind::Query) => 30,
    };
    Duration::from_millis(ms)
}

/// One entry of a print job. Order across items is significant.
#[derive(Debug, Clone)]
pub struct PrintItem {
    pub id: u32,
    pub bitmap: Bitmap,
    /// Pre-feed (positive) or retract (negative) in print-line units,
    /// applied before the item's image.
    pub offset: i32,
}

/// Session tuning. `speed`/`energy` drive the GB configure sequence,
/// `intensity` the MXW01 one.
#[derive(Debug, Clone, Copy)]
pub struct PrintOptions {
    pub speed: u8,
    pub energy: u16,
    pub intensity: u8,
    pub mode: LineMode,
    pub dithering: crate::dithering::Dithering,
    /// Extra paper feed after the end-of-print command.
    pub finish_feed: u16,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            speed: 32,
            energy: 24000,
            intensity: 0x5D,
            mode: LineMode::Monochrome,
            dithering: crate::dithering::Dithering::Threshold,
            finish_feed: 100,
        }
    }
}

/// GB feed rate used while moving paper without drawing.
const TRANSPORT_SPEED: u8 = 8;

/// Next-gen data channel writes are capped at this many bytes.
const DATA_CHUNK_SIZE: usize = 180;

/// Orchestrates one print session against a connected device.
///
/// Owns the transport for its whole lifetime, so two sessions cannot
/// interleave frames on one channel.
pub struct Session<T: Transport, C: Clock = TokioClock> {
    family: ProtocolFamily,
    transport: T,
    clock: C,
    state: DeviceStateHandle,
    options: PrintOptions,
    phase: SessionPhase,
    /// Blank run left over from the previous item, not yet turned into
    /// paper movement.
    pending_feed: u16,
    aborted: bool,
}

impl<T: Transport> Session<T, TokioClock> {
    pub fn new(family: ProtocolFamily, transport: T, state: DeviceStateHandle) -> Self {
        Self::with_clock(family, transport, state, TokioClock)
    }
}

impl<T: Transport, C: Clock> Session<T, C> {
    pub fn with_clock(
        family: ProtocolFamily,
        transport: T,
        state: DeviceStateHandle,
        clock: C,
    ) -> Self {
        Self {
            family,
            transport,
            clock,
            state,
            options: PrintOptions::default(),
            phase: SessionPhase::Idle,
            pending_feed: 0,
            aborted: false,
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Read-only snapshot of the last reported device status.
    pub async fn status(&self) -> DeviceState {
        self.state.snapshot().await
    }

    /// Marks the session aborted after a host-side interruption (link
    /// drop). No command is retried and the phase is left where it was.
    pub fn abort(&mut self) {
        warn!("session aborted by host");
        self.aborted = true;
    }

    /// Runs a whole job through the full lifecycle:
    /// configure → begin → per-item transfer → finish.
    pub async fn run_job(
        &mut self,
        items: &[PrintItem],
        options: PrintOptions,
    ) -> Result<(), PrinterError> {
        self.configure(options).await?;
        self.begin(items).await?;
        for item in items {
            self.print(item).await?;
        }
        self.finish(options.finish_feed).await
    }

    /// Idle → Configuring: issue the family's setup commands. GB firmwares
    /// have no 4bpp line encoding, so grayscale mode is rejected upfront.
    pub async fn configure(&mut self, options: PrintOptions) -> Result<(), PrinterError> {
        self.expect_phase(SessionPhase::Idle)?;
        if self.family == ProtocolFamily::Legacy && options.mode == LineMode::Grayscale {
            return Err(PrinterError::Unsupported {
                family: self.family,
                what: "4bpp grayscale lines",
            });
        }
        self.options = options;
        match self.family {
            ProtocolFamily::Legacy => {
                self.send(
                    CommandKind::Configure,
                    LegacyCommand::SetSpeed as u8,
                    &[options.speed],
                )
                .await?;
                self.send(
                    CommandKind::Configure,
                    LegacyCommand::SetEnergy as u8,
                    &options.energy.to_le_bytes(),
                )
                .await?;
                self.send(CommandKind::Configure, LegacyCommand::ApplyEnergy as u8, &[0x01])
                    .await?;
            }
            ProtocolFamily::NextGen => {
                self.send(
                    CommandKind::Configure,
                    NextGenCommand::SetIntensity as u8,
                    &[options.intensity],
                )
                .await?;
            }
        }
        self.set_phase(SessionPhase::Configuring).await;
        Ok(())
    }

    /// Configuring → Printing: open the print window. The next-gen firmware
    /// wants the total line count upfront; GB firmwares stream per-line and
    /// only need the start marker.
    pub async fn begin(&mut self, items: &[PrintItem]) -> Result<(), PrinterError> {
        self.expect_phase(SessionPhase::Configuring)?;
        match self.family {
            ProtocolFamily::Legacy => {
                self.send(
                    CommandKind::BeginPrint,
                    LegacyCommand::Lattice as u8,
                    &protocol::LATTICE_START,
                )
                .await?;
            }
            ProtocolFamily::NextGen => {
                let total = job_line_count(items)?;
                let mut payload = Vec::with_capacity(4);
                payload.extend_from_slice(&total.to_le_bytes());
                payload.push(0x30);
                payload.push(self.options.mode.mode_byte());
                self.send(CommandKind::BeginPrint, NextGenCommand::PrintRequest as u8, &payload)
                    .await?;
            }
        }
        self.set_phase(SessionPhase::Printing).await;
        Ok(())
    }

    /// Transfers one item: leading offset, then the image as draw/feed ops.
    /// Must be in the Printing phase.
    pub async fn print(&mut self, item: &PrintItem) -> Result<(), PrinterError> {
        self.expect_phase(SessionPhase::Printing)?;
        info!(
            id = item.id,
            width = item.bitmap.width,
            height = item.bitmap.height,
            "printing item"
        );

        // fold the previous item's trailing blank run into this offset
        let lead = self.pending_feed as i32 + item.offset;
        self.pending_feed = 0;
        match self.family {
            ProtocolFamily::Legacy => self.move_paper(lead).await?,
            // the window is open and its line count declared; paper only
            // moves as blank data lines until the flush
            ProtocolFamily::NextGen => {
                if lead > 0 {
                    self.feed_within_image(lead as u16).await?;
                }
            }
        }

        let lines = match self.options.mode {
            LineMode::Monochrome => {
                raster::pack_image(&raster::prepare_rows(&item.bitmap, self.options.dithering)?)?
            }
            LineMode::Grayscale => raster::pack_gray_image(&raster::gray_rows(&item.bitmap)?)?,
        };
        let Plan { ops, trailing_feed } = collapse_blank_runs(lines);
        debug!(ops = ops.len(), trailing_feed, "dispatching line ops");
        for op in ops {
            match op {
                LineOp::Draw(line) => self.draw_line(&line).await?,
                LineOp::Feed(count) => self.feed_within_image(count).await?,
            }
        }
        self.pending_feed = trailing_feed;
        Ok(())
    }

    /// Printing → Finishing → Idle: flush any pending blank run, close the
    /// print window, then feed out extra paper.
    pub async fn finish(&mut self, extra_feed: u16) -> Result<(), PrinterError> {
        self.expect_phase(SessionPhase::Printing)?;
        let pending = self.pending_feed;
        self.pending_feed = 0;
        if pending > 0 {
            self.feed_within_image(pending).await?;
        }
        self.set_phase(SessionPhase::Finishing).await;
        match self.family {
            ProtocolFamily::Legacy => {
                self.send(
                    CommandKind::EndPrint,
                    LegacyCommand::Lattice as u8,
                    &protocol::LATTICE_FINISH,
                )
                .await?;
            }
            ProtocolFamily::NextGen => {
                self.send(CommandKind::EndPrint, NextGenCommand::FlushData as u8, &[0x00])
                    .await?;
            }
        }
        if extra_feed > 0 {
            self.move_paper(extra_feed as i32).await?;
        }
        self.set_phase(SessionPhase::Idle).await;
        info!("print session complete");
        Ok(())
    }

    /// Asks the device to report its status on the notification channel.
    pub async fn request_status(&mut self) -> Result<(), PrinterError> {
        self.check_live()?;
        let opcode = match self.family {
            ProtocolFamily::Legacy => LegacyCommand::GetStatus as u8,
            ProtocolFamily::NextGen => NextGenCommand::GetStatus as u8,
        };
        self.send(CommandKind::Query, opcode, &[0x00]).await
    }

    /// Asks for the battery level. GB firmwares fold what little they
    /// report into the status frame, so this is a status query there.
    pub async fn request_battery(&mut self) -> Result<(), PrinterError> {
        self.check_live()?;
        let opcode = match self.family {
            ProtocolFamily::Legacy => LegacyCommand::GetStatus as u8,
            ProtocolFamily::NextGen => NextGenCommand::GetBattery as u8,
        };
        self.send(CommandKind::Query, opcode, &[0x00]).await
    }

    fn check_live(&self) -> Result<(), PrinterError> {
        if self.aborted {
            return Err(PrinterError::SessionAborted);
        }
        Ok(())
    }

    fn expect_phase(&self, expected: SessionPhase) -> Result<(), PrinterError> {
        self.check_live()?;
        if self.phase != expected {
            return Err(PrinterError::InvalidSessionState {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    async fn set_phase(&mut self, phase: SessionPhase) {
        debug!(?phase, "session phase");
        self.phase = phase;
        self.state.set_phase(phase).await;
    }

    /// Encodes and writes one command frame, then holds the mandated delay.
    /// The first transport failure poisons the session.
    async fn send(
        &mut self,
        kind: CommandKind,
        opcode: u8,
        payload: &[u8],
    ) -> Result<(), PrinterError> {
        let frame = protocol::encode(self.family, opcode, payload)?;
        if let Err(err) = self.transport.write_command(&frame).await {
            self.aborted = true;
            return Err(err);
        }
        self.clock.sleep(mandated_delay(self.family, kind)).await;
        Ok(())
    }

    async fn send_data(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        if let Err(err) = self.transport.write_data(bytes).await {
            self.aborted = true;
            return Err(err);
        }
        self.clock
            .sleep(mandated_delay(self.family, CommandKind::DataChunk))
            .await;
        Ok(())
    }

    async fn draw_line(&mut self, line: &[u8]) -> Result<(), PrinterError> {
        match self.family {
            ProtocolFamily::Legacy => {
                self.send(CommandKind::DrawLine, LegacyCommand::DrawLine as u8, line)
                    .await
            }
            ProtocolFamily::NextGen => {
                for chunk in line.chunks(DATA_CHUNK_SIZE) {
                    self.send_data(chunk).await?;
                }
                Ok(())
            }
        }
    }

    /// Paper movement inside the image. GB devices take a feed frame at
    /// transport speed; the MXW01 cannot feed inside a declared print
    /// window, so the blank lines go out as data and keep the upfront line
    /// count honest.
    async fn feed_within_image(&mut self, count: u16) -> Result<(), PrinterError> {
        match self.family {
            ProtocolFamily::Legacy => self.move_paper(count as i32).await,
            ProtocolFamily::NextGen => {
                let blank = vec![0u8; self.options.mode.line_bytes()];
                for _ in 0..count {
                    self.draw_line(&blank).await?;
                }
                Ok(())
            }
        }
    }

    /// Feed (positive) or retract (negative) outside of image data. Moves
    /// beyond the 16-bit feed field are an error, not a truncation.
    async fn move_paper(&mut self, lines: i32) -> Result<(), PrinterError> {
        if lines == 0 {
            return Ok(());
        }
        let count = u16::try_from(lines.unsigned_abs())
            .map_err(|_| PrinterError::FeedOutOfRange(lines))?
            .to_le_bytes();
        match self.family {
            ProtocolFamily::Legacy => {
                self.send(CommandKind::Configure, LegacyCommand::SetSpeed as u8, &[TRANSPORT_SPEED])
                    .await?;
                if lines > 0 {
                    self.send(CommandKind::Feed, LegacyCommand::Feed as u8, &count)
                        .await?;
                } else {
                    self.send(CommandKind::Retract, LegacyCommand::Retract as u8, &count)
                        .await?;
                }
                self.send(
                    CommandKind::Configure,
                    LegacyCommand::SetSpeed as u8,
                    &[self.options.speed],
                )
                .await
            }
            ProtocolFamily::NextGen => {
                if lines > 0 {
                    self.send(CommandKind::Feed, NextGenCommand::Feed as u8, &count)
                        .await
                } else {
                    self.send(CommandKind::Retract, NextGenCommand::Retract as u8, &count)
                        .await
                }
            }
        }
    }
}

/// Total declared line count for a next-gen job: every item is padded to
/// the firmware minimum before transfer, and positive offsets travel as
/// blank lines inside the window so they count too. The window cannot move
/// paper backwards, so retract offsets are rejected here.
fn job_line_count(items: &[PrintItem]) -> Result<u16, PrinterError> {
    let mut total = 0usize;
    for item in items {
        if item.offset < 0 {
            return Err(PrinterError::Unsupported {
                family: ProtocolFamily::NextGen,
                what: "retract offsets inside a print window",
            });
        }
        total += item.offset as usize + (item.bitmap.height as usize).max(raster::MIN_LINES);
    }
    u16::try_from(total).map_err(|_| PrinterError::PayloadTooLarge(total))
}
