//! Repeats what it is told.

use std::sync::Arc;

use async_trait::async_trait;
use framex_core::consts::VERSION;
use framex_core::event::{make_stream_event, StreamEventType};
use framex_core::{
    CallKind, FieldDef, HttpMethod, Kwargs, ModelSchema, Param, ParamType, PluginMetadata,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::plugin::{parse_args, DeploymentInit, Operation, PluginModule, PluginScope, PluginService};

pub const MODULE: PluginModule = PluginModule {
    module_name: "framex.plugins.echo",
    metadata,
    register,
};

fn metadata() -> PluginMetadata {
    PluginMetadata::new("echo", VERSION)
        .description("Repeats what you say.")
        .author("framex")
        .url("https://github.com/touale/FrameX-kit")
}

fn register(scope: &mut PluginScope<'_>) -> anyhow::Result<()> {
    scope.register::<EchoPlugin>()?;
    Ok(())
}

#[derive(Deserialize)]
struct MessageArgs {
    message: String,
}

#[derive(Deserialize)]
struct ModelArgs {
    message: String,
    model: Value,
}

fn echo_model_schema() -> ModelSchema {
    ModelSchema::new(
        "EchoModel",
        vec![
            FieldDef {
                name: "id".into(),
                ty: ParamType::Integer,
                required: true,
                default: None,
            },
            FieldDef {
                name: "name".into(),
                ty: ParamType::String,
                required: true,
                default: None,
            },
        ],
    )
}

pub struct EchoPlugin;

impl EchoPlugin {
    fn echo(kwargs: Kwargs) -> anyhow::Result<Value> {
        let args: MessageArgs = parse_args(kwargs)?;
        Ok(Value::String(args.message))
    }

    fn echo_model(kwargs: Kwargs) -> anyhow::Result<Value> {
        let args: ModelArgs = parse_args(kwargs)?;
        Ok(Value::String(format!("{},{}", args.message, args.model)))
    }

    fn confess(kwargs: Kwargs) -> anyhow::Result<Value> {
        let args: MessageArgs = parse_args(kwargs)?;
        Ok(json!(format!("I am echo! Received your message {}", args.message)))
    }

    /// Word-sized `message_chunk` frames of the reply, then `finish`.
    fn echo_stream(kwargs: Kwargs) -> impl Stream<Item = anyhow::Result<String>> {
        let frames: Vec<anyhow::Result<String>> = match parse_args::<MessageArgs>(kwargs) {
            Ok(args) => {
                let reply = format!("You said: {}", args.message);
                reply
                    .split_inclusive(' ')
                    .map(|word| Ok(make_stream_event(StreamEventType::MessageChunk, word)))
                    .chain(std::iter::once(Ok(make_stream_event(
                        StreamEventType::Finish,
                        Value::Null,
                    ))))
                    .collect()
            }
            Err(err) => vec![Err(err)],
        };
        stream::iter(frames)
    }
}

#[async_trait]
impl PluginService for EchoPlugin {
    const TYPE_NAME: &'static str = "EchoPlugin";

    fn operations() -> Vec<Operation<Self>> {
        let message = || Param::new("message", ParamType::String);
        vec![
            Operation::unary("__call__", |_this: Arc<Self>, kwargs| async move {
                Self::echo(kwargs)
            })
            .path("/echo")
            .param(message()),
            Operation::unary("echo_model", |_this: Arc<Self>, kwargs| async move {
                Self::echo_model(kwargs)
            })
            .path("/echo_model")
            .methods(&[HttpMethod::Post])
            .param(message())
            .param(Param::new("model", ParamType::Model(echo_model_schema()))),
            Operation::stream("echo_stream", |_this: Arc<Self>, kwargs| {
                Self::echo_stream(kwargs)
            })
            .path("/echo_stream")
            .param(message()),
            Operation::unary("confess", |_this: Arc<Self>, kwargs| async move {
                Self::confess(kwargs)
            })
            .kind(CallKind::Function)
            .param(message()),
        ]
    }

    async fn create(_init: DeploymentInit) -> anyhow::Result<Self> {
        Ok(Self)
    }
}
