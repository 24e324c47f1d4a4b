//! Calls other plugins' operations through its remote APIs.

use std::sync::Arc;

use async_trait::async_trait;
use framex_core::consts::VERSION;
use framex_core::event::{frame_data, frame_event_type, StreamEventType};
use framex_core::{Kwargs, Param, ParamType, PluginMetadata};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::plugin::{
    parse_args, DeploymentInit, Operation, PluginModule, PluginScope, PluginService, RemoteApis,
};

pub const MODULE: PluginModule = PluginModule {
    module_name: "framex.plugins.invoker",
    metadata,
    register,
};

/// Catalog name of the forwardable greeting function.
pub const REMOTE_GREET: &str = "invoker.remote_greet";

fn metadata() -> PluginMetadata {
    PluginMetadata::new("invoker", VERSION)
        .description("Invokes remote operations.")
        .author("framex")
        .url("https://github.com/touale/FrameX-kit")
        .requires([
            "/api/v1/echo",
            "echo.EchoPlugin.confess",
            "/api/v1/echo_stream",
            "/api/v1/echo_model",
        ])
}

fn register(scope: &mut PluginScope<'_>) -> anyhow::Result<()> {
    scope.register::<InvokerPlugin>()?;
    Ok(())
}

#[derive(Deserialize)]
struct MessageArgs {
    message: String,
}

#[derive(Deserialize)]
struct GreetArgs {
    a: String,
}

fn remote_greet(kwargs: Kwargs) -> anyhow::Result<Value> {
    let args: GreetArgs = parse_args(kwargs)?;
    Ok(json!(format!("remote_greet: {}", args.a)))
}

/// Concatenated `content` of the `message_chunk` frames in `chunks`.
fn stream_text(chunks: &Value) -> String {
    chunks
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|frame| frame_event_type(frame) == Some(StreamEventType::MessageChunk.as_str()))
        .filter_map(|frame| {
            frame_data(frame)?
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

pub struct InvokerPlugin {
    remote_apis: RemoteApis,
}

impl InvokerPlugin {
    async fn evoke(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        let args: MessageArgs = parse_args(kwargs)?;
        let mut message = Kwargs::new();
        message.insert("message".into(), json!(args.message));

        let echo = self.remote_apis.call("/api/v1/echo", message.clone()).await?;
        let stream = self
            .remote_apis
            .call("/api/v1/echo_stream", message.clone())
            .await?;
        let confess = self
            .remote_apis
            .call("echo.EchoPlugin.confess", message.clone())
            .await?;
        message.insert("model".into(), json!({"id": 1, "name": "framex"}));
        let echo_model = self.remote_apis.call("/api/v1/echo_model", message).await?;

        Ok(json!([echo, stream_text(&stream), confess, echo_model]))
    }

    async fn evoke_remote(&self, kwargs: Kwargs) -> anyhow::Result<Value> {
        Ok(self.remote_apis.call_proxy_function(REMOTE_GREET, kwargs).await?)
    }
}

#[async_trait]
impl PluginService for InvokerPlugin {
    const TYPE_NAME: &'static str = "InvokerPlugin";

    fn operations() -> Vec<Operation<Self>> {
        vec![
            Operation::unary("evoke", |this: Arc<Self>, kwargs| async move {
                this.evoke(kwargs).await
            })
            .path("/evoke_echo")
            .param(Param::new("message", ParamType::String)),
            Operation::unary("evoke_remote", |this: Arc<Self>, kwargs| async move {
                this.evoke_remote(kwargs).await
            })
            .path("/evoke_remote")
            .param(Param::new("a", ParamType::String)),
        ]
    }

    async fn create(init: DeploymentInit) -> anyhow::Result<Self> {
        init.functions
            .register_fn(REMOTE_GREET, |kwargs: Kwargs| async move { remote_greet(kwargs) });
        Ok(Self {
            remote_apis: init.remote_apis,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use framex_core::OperationDescriptor;

    use super::*;
    use crate::adapter::{DeploymentUnit, LocalAdapter, SharedHandle};
    use crate::plugin::{FunctionCatalog, ServiceUnit};
    use crate::plugins::echo::EchoPlugin;

    fn init(
        target: &str,
        apis: HashMap<String, OperationDescriptor>,
        adapter: Arc<LocalAdapter>,
        functions: Arc<FunctionCatalog>,
    ) -> DeploymentInit {
        DeploymentInit {
            target: target.into(),
            plugin_id: target.split('.').next().unwrap_or_default().into(),
            remote_apis: RemoteApis::new(apis, adapter, Arc::clone(&functions)),
            config: Value::Null,
            functions,
        }
    }

    /// An invoker wired to an in-process echo deployment.
    async fn invoker() -> SharedHandle {
        let adapter = Arc::new(LocalAdapter::new());
        let functions = Arc::new(FunctionCatalog::default());

        let echo = ServiceUnit::<EchoPlugin>::new("echo.EchoPlugin")
            .create(init(
                "echo.EchoPlugin",
                HashMap::new(),
                Arc::clone(&adapter),
                Arc::clone(&functions),
            ))
            .await
            .unwrap();
        adapter.insert_handle(echo);

        let apis: HashMap<String, OperationDescriptor> = EchoPlugin::operations()
            .iter()
            .map(|op| op.describe("echo.EchoPlugin", &[]).unwrap())
            .map(|desc| {
                let key = desc.path.clone().unwrap_or_else(|| desc.function_key());
                (key, desc)
            })
            .collect();
        ServiceUnit::<InvokerPlugin>::new("invoker.InvokerPlugin")
            .create(init("invoker.InvokerPlugin", apis, adapter, functions))
            .await
            .unwrap()
    }

    #[test]
    fn stream_text_joins_message_chunks_only() {
        let chunks = json!([
            "event: message_chunk\ndata: {\"content\":\"a \"}\n\n",
            "event: debug\ndata: {\"content\":\"skip\"}\n\n",
            "event: message_chunk\ndata: {\"content\":\"b\"}\n\n",
            "event: finish\ndata: {}\n\n",
        ]);
        assert_eq!(stream_text(&chunks), "a b");
        assert_eq!(stream_text(&json!("not a list")), "");
    }

    #[tokio::test]
    async fn evoke_echo_gathers_every_remote_result() {
        let handle = invoker().await;
        let mut kwargs = Kwargs::new();
        kwargs.insert("message".into(), json!("hello world"));

        let out = handle.call("evoke", kwargs).await.unwrap();
        assert_eq!(
            out,
            json!([
                "hello world",
                "You said: hello world",
                "I am echo! Received your message hello world",
                "hello world,{\"id\":1,\"name\":\"framex\"}",
            ])
        );
    }

    #[tokio::test]
    async fn evoke_remote_runs_the_catalog_function_in_place() {
        let handle = invoker().await;
        let mut kwargs = Kwargs::new();
        kwargs.insert("a".into(), json!("123"));
        assert_eq!(
            handle.call("evoke_remote", kwargs).await.unwrap(),
            json!("remote_greet: 123")
        );
    }
}
