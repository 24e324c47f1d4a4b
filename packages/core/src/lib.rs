//! `FrameX` core: operation descriptors, parameter schemas, the opaque value
//! codec and server-sent-event framing.

pub mod codec;
pub mod consts;
pub mod event;
pub mod path;
pub mod schema;
pub mod types;

pub use codec::CodecError;
pub use event::{make_stream_event, StreamEventType};
pub use schema::{FieldDef, ModelSchema, Param, ParamType, ValidationError};
pub use types::{CallKind, HttpMethod, Kwargs, OperationDescriptor, PluginMetadata};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
