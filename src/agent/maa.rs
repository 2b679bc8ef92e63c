//! `AgentBackend` and `RecognitionHost` on top of the framework C API.

use std::ffi::{c_char, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Runtime;

use crate::agent::ffi::{
    lossy_str, to_cstring, MaaApi, MaaContext, MaaImageBuffer, MaaRect, MaaRecoId, MaaStringBuffer,
    MaaTaskId, MAA_FALSE, MAA_INVALID_ID, MAA_TRUE,
};
use crate::agent::server::{run_analysis, AgentBackend};
use crate::errors::{TowerError, TowerResult};
use crate::recognition::traits::{CustomRecognition, RecognitionHost};
use crate::recognition::types::{AnalyzeArgs, Frame, NativeImage, RecognitionDetail};

/// What a registered callback needs; its address is the callback's `trans_arg`.
struct CallbackState {
    handler: Arc<dyn CustomRecognition>,
    api: Arc<MaaApi>,
    runtime: Arc<Runtime>,
}

pub struct MaaAgentBackend {
    api: Arc<MaaApi>,
    /// Drives handler futures on the framework's callback threads.
    runtime: Arc<Runtime>,
    /// Boxed so every `trans_arg` handed out stays at a fixed address.
    registrations: Mutex<Vec<Box<CallbackState>>>,
}

impl MaaAgentBackend {
    pub fn new(api: Arc<MaaApi>) -> TowerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("towerpick-analyze")
            .enable_all()
            .build()?;
        Ok(Self {
            api,
            runtime: Arc::new(runtime),
            registrations: Mutex::new(Vec::new()),
        })
    }
}

impl AgentBackend for MaaAgentBackend {
    fn register_recognition(&self, name: &str, handler: Arc<dyn CustomRecognition>) -> TowerResult<()> {
        let c_name = to_cstring(name)?;
        let state = Box::new(CallbackState {
            handler,
            api: self.api.clone(),
            runtime: self.runtime.clone(),
        });
        let trans_arg = &*state as *const CallbackState as *mut c_void;

        // SAFETY: `state` is kept alive in `registrations` for as long as the
        // backend exists, which outlives the session.
        let ok = unsafe {
            (self.api.register_custom_recognition)(c_name.as_ptr(), Some(recognition_callback), trans_arg)
        };
        if ok == MAA_FALSE {
            return Err(TowerError::Agent(format!(
                "framework refused custom recognition '{name}'"
            )));
        }
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(state);
        Ok(())
    }

    fn start_up(&self, identifier: &str) -> TowerResult<()> {
        let c_identifier = to_cstring(identifier)?;
        // SAFETY: valid NUL-terminated identifier for the duration of the call.
        let ok = unsafe { (self.api.start_up)(c_identifier.as_ptr()) };
        if ok == MAA_FALSE {
            return Err(TowerError::Agent(format!(
                "agent server failed to start with identifier '{identifier}'"
            )));
        }
        Ok(())
    }

    fn join(&self) {
        // SAFETY: no arguments; blocks until the host disconnects.
        unsafe { (self.api.join)() }
    }

    fn shut_down(&self) {
        // SAFETY: no arguments; safe to call after join has returned.
        unsafe { (self.api.shut_down)() }
    }
}

/// Entry point the framework calls once per custom-recognition invocation.
unsafe extern "C" fn recognition_callback(
    context: *mut MaaContext,
    task_id: MaaTaskId,
    node_name: *const c_char,
    custom_recognition_name: *const c_char,
    custom_recognition_param: *const c_char,
    image: *const MaaImageBuffer,
    _roi: *const MaaRect,
    trans_arg: *mut c_void,
    out_box: *mut MaaRect,
    out_detail: *mut MaaStringBuffer,
) -> u8 {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Some(state) = (trans_arg as *const CallbackState).as_ref() else {
            tracing::error!(task_id, "custom recognition invoked without state");
            return MAA_FALSE;
        };
        let Some(context) = ContextHandle::new(context) else {
            tracing::error!(task_id, "custom recognition invoked without context");
            return MAA_FALSE;
        };
        let api = &state.api;

        let task = lossy_str(node_name);
        let name = lossy_str(custom_recognition_name);
        let custom_param = serde_json::Value::String(lossy_str(custom_recognition_param).into_owned());
        let frame = match NativeImage::new(image.cast()) {
            Some(native) => {
                let width = (api.image_width)(image).max(0) as u32;
                let height = (api.image_height)(image).max(0) as u32;
                Frame::from_native(native, width, height)
            }
            None => {
                tracing::warn!(task_id, "custom recognition invoked without an image");
                Frame::detached(0, 0)
            }
        };
        tracing::debug!(
            task_id,
            task = %task,
            recognition = %name,
            width = frame.width(),
            height = frame.height(),
            "analyze requested"
        );

        let host = MaaContextHost {
            api: api.clone(),
            context,
        };
        let result = run_analysis(
            &state.runtime,
            state.handler.as_ref(),
            &host,
            AnalyzeArgs {
                task: &task,
                name: &name,
                custom_param: &custom_param,
                frame: &frame,
            },
        );

        if !out_detail.is_null() {
            if let Err(e) = api.write_string_buffer(out_detail, &result.detail) {
                tracing::warn!(task_id, error = %e, "cannot return detail to host");
            }
        }
        match result.rect {
            Some(rect) if !out_box.is_null() => {
                *out_box = rect.into();
                MAA_TRUE
            }
            _ => MAA_FALSE,
        }
    }));

    outcome.unwrap_or_else(|_| {
        tracing::error!(task_id, "custom recognition panicked");
        MAA_FALSE
    })
}

/// Framework context of the invocation in progress.
#[derive(Debug, Clone, Copy)]
struct ContextHandle(NonNull<MaaContext>);

// SAFETY: the context is valid for the whole callback and the framework
// serializes calls made through it; the handle never leaves the callback.
unsafe impl Send for ContextHandle {}
unsafe impl Sync for ContextHandle {}

impl ContextHandle {
    fn new(ptr: *mut MaaContext) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    fn as_ptr(&self) -> *mut MaaContext {
        self.0.as_ptr()
    }
}

/// Recognition service of the host, reached through the invocation context.
struct MaaContextHost {
    api: Arc<MaaApi>,
    context: ContextHandle,
}

impl MaaContextHost {
    fn recognition_detail(&self, reco_id: MaaRecoId) -> TowerResult<RecognitionDetail> {
        // SAFETY: the context is live for the current callback.
        let tasker = unsafe { (self.api.get_tasker)(self.context.as_ptr()) };
        if tasker.is_null() {
            return Err(TowerError::Probe("context has no tasker".into()));
        }

        let mut node_name = self.api.string_buffer()?;
        let mut algorithm = self.api.string_buffer()?;
        let mut detail_json = self.api.string_buffer()?;
        let mut hit = MAA_FALSE;
        let mut best_box = MaaRect::default();

        // SAFETY: every out-pointer is live; raw image and draws are optional.
        let ok = unsafe {
            (self.api.get_recognition_detail)(
                tasker,
                reco_id,
                node_name.as_mut_ptr(),
                algorithm.as_mut_ptr(),
                &mut hit,
                &mut best_box,
                detail_json.as_mut_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ok == MAA_FALSE {
            return Err(TowerError::Probe(format!(
                "recognition detail {reco_id} unavailable"
            )));
        }

        let hit = hit != MAA_FALSE;
        let raw = detail_json.read();
        let detail = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(raw),
        };
        Ok(RecognitionDetail {
            reco_id,
            name: node_name.read(),
            algorithm: algorithm.read(),
            hit,
            best_box: hit.then(|| best_box.into()),
            detail,
        })
    }
}

#[async_trait]
impl RecognitionHost for MaaContextHost {
    async fn run_recognition(
        &self,
        entry: &str,
        frame: &Frame,
        pipeline_override: serde_json::Value,
    ) -> TowerResult<Option<RecognitionDetail>> {
        let Some(image) = frame.native() else {
            return Err(TowerError::Probe("frame carries no host image".into()));
        };
        let c_entry = to_cstring(entry)?;
        let c_override = to_cstring(&pipeline_override.to_string())?;

        // SAFETY: context and image are live for the current callback; the
        // strings outlive the call.
        let reco_id = unsafe {
            (self.api.run_recognition)(
                self.context.as_ptr(),
                c_entry.as_ptr(),
                c_override.as_ptr(),
                image.as_ptr().cast(),
            )
        };
        if reco_id == MAA_INVALID_ID {
            tracing::debug!(entry = %entry, "recognition produced no result");
            return Ok(None);
        }
        self.recognition_detail(reco_id).map(Some)
    }
}
