//! Native functions the interpreter calls back into the host through.
//!
//! The interpreter runs on a blocking thread. Host state for the current
//! invocation sits in a thread-local slot for the lifetime of a
//! [`BridgeGuard`], so the natives are plain function pointers with no
//! captured state for the garbage collector to trace.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use boa_engine::{Context, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, js_string};
use bytes::Bytes;
use tokio::runtime::Handle;

use crate::capability::{
    BinaryStore, CapabilityContext, HelperError, HttpProxy, HttpRequest, LogEntry, LogLevel,
    LogSink,
};
use crate::record::{Attachments, BinaryData};

/// Host state reachable from guest code during one invocation.
pub(super) struct HostBridge {
    log_sink: Arc<dyn LogSink>,
    item_index: Option<usize>,
    http: Option<Arc<dyn HttpProxy>>,
    binary_store: Option<Arc<dyn BinaryStore>>,
    binary: bool,
    encoding: bool,
    attachments: BTreeMap<usize, Attachments>,
    runtime: Handle,
}

impl HostBridge {
    pub(super) fn new(context: &CapabilityContext, runtime: Handle) -> Self {
        let helpers = context.helpers();
        Self {
            log_sink: Arc::clone(context.log_sink()),
            item_index: context.view().item_index(),
            http: helpers.http.clone(),
            binary_store: helpers.binary_store.clone(),
            binary: helpers.binary,
            encoding: helpers.encoding,
            attachments: context
                .view()
                .records()
                .into_iter()
                .filter(|(_, record)| !record.attachments.is_empty())
                .map(|(index, record)| (index, record.attachments.clone()))
                .collect(),
            runtime,
        }
    }

    fn read_attachment(&self, item_index: usize, name: &str) -> Result<Bytes, HelperError> {
        if !self.binary {
            return Err(HelperError::Disabled("binary data"));
        }
        let attachment = self
            .attachments
            .get(&item_index)
            .and_then(|attachments| attachments.get(name))
            .ok_or_else(|| {
                HelperError::BinaryNotFound(format!("no attachment `{name}` on item {item_index}"))
            })?;
        match &attachment.data {
            BinaryData::Inline(bytes) => Ok(bytes.clone()),
            BinaryData::Handle(handle) => self
                .binary_store
                .as_ref()
                .ok_or_else(|| {
                    HelperError::BinaryNotFound(format!(
                        "attachment `{name}` is stored out of band and no binary store is available"
                    ))
                })?
                .read(handle),
        }
    }
}

thread_local! {
    static BRIDGE: RefCell<Option<Rc<HostBridge>>> = const { RefCell::new(None) };
}

/// Keeps a bridge installed on the current thread until dropped.
pub(super) struct BridgeGuard {
    _thread_bound: PhantomData<Rc<()>>,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        BRIDGE.with(|slot| slot.borrow_mut().take());
    }
}

/// Installs `bridge` for the current thread.
pub(super) fn install(bridge: HostBridge) -> BridgeGuard {
    BRIDGE.with(|slot| *slot.borrow_mut() = Some(Rc::new(bridge)));
    BridgeGuard {
        _thread_bound: PhantomData,
    }
}

/// Registers the host natives as globals.
pub(super) fn register(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        js_string!("__nebulaHostLog"),
        2,
        NativeFunction::from_fn_ptr(host_log),
    )?;
    context.register_global_callable(
        js_string!("__nebulaHostHttp"),
        1,
        NativeFunction::from_fn_ptr(host_http),
    )?;
    context.register_global_callable(
        js_string!("__nebulaHostBinary"),
        2,
        NativeFunction::from_fn_ptr(host_binary),
    )?;
    context.register_global_callable(
        js_string!("__nebulaHostBase64Encode"),
        1,
        NativeFunction::from_fn_ptr(host_base64_encode),
    )?;
    context.register_global_callable(
        js_string!("__nebulaHostBase64Decode"),
        1,
        NativeFunction::from_fn_ptr(host_base64_decode),
    )?;
    Ok(())
}

fn with_bridge<R>(f: impl FnOnce(&HostBridge) -> JsResult<R>) -> JsResult<R> {
    let bridge = BRIDGE.with(|slot| slot.borrow().clone());
    match bridge {
        Some(bridge) => f(&bridge),
        None => Err(guest_error("host bridge is not installed")),
    }
}

fn guest_error(message: impl std::fmt::Display) -> JsError {
    JsNativeError::error()
        .with_message(message.to_string())
        .into()
}

fn js_text(text: &str) -> JsValue {
    JsValue::from(JsString::from(text))
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) => Ok(value.to_string(context)?.to_std_string_escaped()),
        None => Ok(String::new()),
    }
}

fn host_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = string_arg(args, 0, context)?;
    let message = string_arg(args, 1, context)?;
    with_bridge(|bridge| {
        bridge.log_sink.log(LogEntry {
            level: LogLevel::from_guest(&level),
            message,
            item_index: bridge.item_index,
        });
        Ok(JsValue::undefined())
    })
}

fn host_http(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let options = string_arg(args, 0, context)?;
    with_bridge(|bridge| {
        let proxy = bridge
            .http
            .clone()
            .ok_or_else(|| guest_error(HelperError::Disabled("http request")))?;
        let request: HttpRequest = serde_json::from_str(&options)
            .map_err(|e| guest_error(HelperError::InvalidRequest(e.to_string())))?;
        let response = bridge
            .runtime
            .block_on(proxy.request(request))
            .map_err(guest_error)?;
        let encoded = serde_json::to_string(&response).map_err(guest_error)?;
        Ok(js_text(&encoded))
    })
}

fn host_binary(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let item_index = match args.first() {
        Some(value) => value.to_number(context)?,
        None => 0.0,
    };
    let name = string_arg(args, 1, context)?;
    with_bridge(|bridge| {
        let bytes = bridge
            .read_attachment(item_index as usize, &name)
            .map_err(guest_error)?;
        Ok(js_text(&STANDARD.encode(bytes)))
    })
}

fn host_base64_encode(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let text = string_arg(args, 0, context)?;
    with_bridge(|bridge| {
        if !bridge.encoding {
            return Err(guest_error(HelperError::Disabled("base64")));
        }
        Ok(js_text(&STANDARD.encode(text.as_bytes())))
    })
}

fn host_base64_decode(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let encoded = string_arg(args, 0, context)?;
    with_bridge(|bridge| {
        if !bridge.encoding {
            return Err(guest_error(HelperError::Disabled("base64")));
        }
        let bytes = STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| guest_error(format!("invalid base64: {e}")))?;
        Ok(js_text(&String::from_utf8_lossy(&bytes)))
    })
}
