//! catprint: drive cat thermal printers (GB series and MXW01) over BLE.
//!
//! Main modules:
//! - ble: BLE transport, scan/connect
//! - dithering: grayscale-to-bilevel conversion
//! - plan: blank-run optimization
//! - protocol: frames, CRC-8, opcode tables, notification decoding
//! - raster: luminance thresholding and pixel packing
//! - session: print lifecycle and mandated command timing

pub mod ble;
pub mod dithering;
pub mod error;
pub mod plan;
pub mod protocol;
pub mod raster;
pub mod session;

/// BLE API: scan/connect to printers
pub use ble::{BlePrinter, DeviceInfo, connect, connect_with_family, scan};
pub use dithering::Dithering;
pub use error::PrinterError;
pub use plan::{LineOp, Plan, collapse_blank_runs};
pub use protocol::{Frame, ProtocolFamily, StatusUpdate, crc8, decode, encode};
pub use raster::{Bitmap, LineMode, MIN_LINES, PRINT_WIDTH};
pub use session::{
    Clock, CommandKind, DeviceState, DeviceStateHandle, PrintItem, PrintOptions, Session,
    SessionPhase, TokioClock, Transport, mandated_delay, pump_notifications,
};
