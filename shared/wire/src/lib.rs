pub mod envelope;
pub mod ident;
pub mod packet;

pub use ident::{short_id_for, ShortId};
pub use packet::{
    AuthCode, CodecTag, GroupDescriptor, GroupOp, GroupOpKind, MediaFrame, Packet, SenderRef,
    WireError,
};
