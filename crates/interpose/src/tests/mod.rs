//! Crate-level integration and BDD tests.

use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::config::EngineConfig;
use crate::error::InterposeError;
use crate::host::{Member, ObjectRef, Value};
use crate::interceptor::{Interceptor, InterceptorKind};
use crate::registry::{Registry, StaticPluginDirectory};


/// Dotted path of the method every scene intercepts.
pub(crate) const TARGET: &str = "A.prototype.x";

/// A root scope holding class `A` whose prototype method `x` returns `1`.
pub(crate) struct Scene {
    pub(crate) root: ObjectRef,
    pub(crate) prototype: ObjectRef,
    pub(crate) instance: ObjectRef,
    pub(crate) plugins: Rc<StaticPluginDirectory>,
    pub(crate) registry: Registry,
}

impl Scene {
    pub(crate) fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub(crate) fn with_config(config: EngineConfig) -> Self {
        let root = ObjectRef::new();
        let class = ObjectRef::new();
        let prototype = ObjectRef::new();
        prototype
            .define_method("x", |_this, _args| Ok(json!(1)))
            .expect("define x");
        class
            .define("prototype", Member::Object(prototype.clone()))
            .expect("define prototype");
        root.define("A", Member::Object(class))
            .expect("define A");
        let instance = ObjectRef::with_prototype(&prototype);

        let plugins = Rc::new(StaticPluginDirectory::new());
        let registry = Registry::new(root.clone(), plugins.clone(), config);
        Self {
            root,
            prototype,
            instance,
            plugins,
            registry,
        }
    }

    /// Registers `interceptor` for a freshly added plugin.
    pub(crate) fn register(&self, owner: &str, interceptor: Interceptor) {
        self.plugins.add(owner);
        self.registry
            .register(owner, TARGET, interceptor)
            .expect("registration succeeds");
    }

    /// Calls `x` on the instance.
    pub(crate) fn call(&self) -> Value {
        self.instance.call("x", &[]).expect("call x")
    }

    pub(crate) fn owners(&self) -> Vec<String> {
        self.registry
            .chain(TARGET)
            .map(|info| info.owners)
            .unwrap_or_default()
    }
}

/// Interceptor of `kind` that calls on (unless terminal) and returns `value`.
pub(crate) fn returning(kind: InterceptorKind, value: i64) -> Interceptor {
    match kind {
        InterceptorKind::Passthrough => Interceptor::passthrough(move |next, _this, args| {
            next.call(args)?;
            Ok(json!(value))
        }),
        InterceptorKind::Mixed => Interceptor::mixed(move |next, _this, args| {
            next.call(args)?;
            Ok(json!(value))
        }),
        InterceptorKind::Override => Interceptor::overriding(move |_this, _args| Ok(json!(value))),
    }
}

/// Interceptor of `kind` that never calls the continuation.
pub(crate) fn short_circuit(kind: InterceptorKind, value: i64) -> Interceptor {
    match kind {
        InterceptorKind::Passthrough => {
            Interceptor::passthrough(move |_next, _this, _args| Ok(json!(value)))
        }
        _ => Interceptor::mixed(move |_next, _this, _args| Ok(json!(value))),
    }
}

#[derive(Clone, Default)]
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("log sink poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `body` with a capturing subscriber and returns its formatted output.
pub(crate) fn capture_logs<T>(body: impl FnOnce() -> T) -> (T, String) {
    let sink = LogSink::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, body);
    let bytes = sink.0.lock().map(|buffer| buffer.clone()).unwrap_or_default();
    (result, String::from_utf8_lossy(&bytes).into_owned())
}

#[test]
fn end_to_end_library_walkthrough() {
    let scene = Scene::new();
    assert_eq!(scene.call(), json!(1), "original");

    scene.register(
        "module1",
        Interceptor::mixed(|next, _this, args| {
            next.call(args)?;
            Ok(json!(1000))
        }),
    );
    assert_eq!(scene.call(), json!(1000), "wrapped by module1");

    let twice = scene
        .registry
        .register("module1", TARGET, returning(InterceptorKind::Mixed, 0))
        .expect_err("second registration by the same owner fails");
    assert!(matches!(twice, InterposeError::DuplicateRegistration { .. }));

    scene.register(
        "module2",
        Interceptor::passthrough(|next, _this, args| {
            assert_eq!(next.call(args)?, json!(1000));
            Ok(json!(20000))
        }),
    );
    assert_eq!(scene.call(), json!(20000), "wrapped by module2");

    scene.register(
        "module3",
        Interceptor::overriding(|_this, args| {
            assert!(args.is_empty(), "override receives only the call arguments");
            Ok(json!(30000))
        }),
    );
    assert_eq!(scene.call(), json!(20000), "override runs last");

    scene.plugins.add("double-override");
    let err = scene
        .registry
        .register(
            "double-override",
            TARGET,
            returning(InterceptorKind::Override, 0),
        )
        .expect_err("second override fails");
    assert!(matches!(
        err,
        InterposeError::AlreadyOverridden { ref conflicting_owner, .. } if conflicting_owner == "module3"
    ));
    assert_eq!(scene.call(), json!(20000), "failed override leaves chain alone");

    scene
        .registry
        .unregister("module2", TARGET, true)
        .expect("unregister module2");
    assert_eq!(scene.call(), json!(1000), "module2 removed");

    scene.register("module2", short_circuit(InterceptorKind::Passthrough, -2));
    assert_eq!(scene.call(), json!(1000), "non-chaining passthrough is ignored");
    assert_eq!(scene.owners(), vec!["module1", "module3"]);

    scene.register("module2", short_circuit(InterceptorKind::Mixed, 20000));
    assert_eq!(scene.call(), json!(20000), "mixed may short-circuit");

    let pre_clear = scene.prototype.get("x").expect("x exists");
    scene.registry.clear(TARGET).expect("clear");
    assert_eq!(scene.call(), json!(1), "unwrapped");
    let pre_clear = pre_clear.as_method().expect("thunk is a method");
    assert_eq!(
        pre_clear.call(&scene.instance, &[]).expect("call pre-clear thunk"),
        json!(1),
        "thunk taken before clearing behaves like the original"
    );

    scene.register(
        "module2",
        Interceptor::mixed(|next, _this, args| {
            next.call(args)?;
            Ok(json!(500))
        }),
    );
    assert_eq!(scene.call(), json!(500), "rewrap after clear");

    let wrapped = scene.prototype.get("x").expect("x exists");
    let wrapped = wrapped.as_method().cloned().expect("thunk is a method");
    scene
        .prototype
        .set(
            "x",
            Member::Method(crate::host::Method::new(move |this, args| {
                wrapped.call(this, args)?;
                Ok(json!(5000))
            })),
        )
        .expect("manual wrap");
    assert_eq!(scene.call(), json!(500), "registered interceptors still run first");
}
