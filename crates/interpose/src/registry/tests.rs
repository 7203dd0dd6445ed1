//! Unit tests for the registry API and owner validation.

use std::rc::Rc;

use mockall::mock;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::host::Member;
use crate::interceptor::InterceptorKind;
use crate::tests::{Scene, TARGET, returning};

mock! {
    Directory {}
    impl PluginDirectory for Directory {
        fn lookup(&self, owner: &str) -> Option<PluginInfo>;
    }
}

fn registry_with(directory: MockDirectory) -> (Registry, ObjectRef) {
    let root = ObjectRef::new();
    let holder = ObjectRef::new();
    holder
        .define_method("run", |_this, _args| Ok(json!("ran")))
        .expect("define run");
    root.define("Tool", Member::Object(holder.clone()))
        .expect("define Tool");
    (
        Registry::new(root, Rc::new(directory), EngineConfig::default()),
        holder,
    )
}

#[rstest]
#[case::unknown(None, "unknown plugin")]
#[case::inactive(Some(PluginInfo::new(false, "Sleepy")), "not active")]
fn register_rejects_invalid_owners(#[case] info: Option<PluginInfo>, #[case] reason: &str) {
    let mut directory = MockDirectory::new();
    directory
        .expect_lookup()
        .withf(|owner| owner == "plugin")
        .times(1)
        .return_const(info);
    let (registry, holder) = registry_with(directory);

    let err = registry
        .register("plugin", "Tool.run", returning(InterceptorKind::Mixed, 0))
        .expect_err("owner rejected");
    assert!(
        matches!(err, InterposeError::InvalidOwner { reason: ref actual, .. } if actual.contains(reason)),
        "unexpected error: {err}"
    );
    assert_eq!(registry.chain_count(), 0);
    assert_eq!(holder.call("run", &[]).expect("call"), json!("ran"));
}

#[test]
fn the_engine_cannot_register_for_itself() {
    let mut directory = MockDirectory::new();
    directory.expect_lookup().never();
    let (registry, _) = registry_with(directory);

    let err = registry
        .register(ENGINE_ID, "Tool.run", returning(InterceptorKind::Mixed, 0))
        .expect_err("reserved owner");
    assert!(matches!(err, InterposeError::InvalidOwner { ref owner, .. } if owner == ENGINE_ID));
}

#[test]
fn active_owners_are_looked_up_on_every_operation() {
    let mut directory = MockDirectory::new();
    directory
        .expect_lookup()
        .withf(|owner| owner == "plugin")
        .times(3)
        .returning(|owner| Some(PluginInfo::new(true, owner)));
    let (registry, holder) = registry_with(directory);

    registry
        .register("plugin", "Tool.run", returning(InterceptorKind::Mixed, 5))
        .expect("register");
    assert_eq!(holder.call("run", &[]).expect("call"), json!(5));
    registry
        .unregister("plugin", "Tool.run", true)
        .expect("unregister");
    registry.clear_module("plugin").expect("clear module");
    assert_eq!(holder.call("run", &[]).expect("call"), json!("ran"));
}

#[test]
fn chained_override_is_an_invalid_argument() {
    let scene = Scene::new();
    scene.plugins.add("confused");
    let interceptor = Interceptor::Chained {
        kind: InterceptorKind::Override,
        callback: Rc::new(
            |next: &crate::interceptor::Next<'_>, _this: &ObjectRef, args: &[crate::host::Value]| {
                next.call(args)
            },
        ),
    };
    let err = scene
        .registry
        .register("confused", TARGET, interceptor)
        .expect_err("invalid kind");
    assert!(matches!(err, InterposeError::InvalidArgument { .. }));
    assert_eq!(scene.registry.chain_count(), 0);
}

#[rstest]
#[case::missing_class("Missing.prototype.x")]
#[case::data_segment("A.prototype.x.y")]
#[case::empty_segment("A..x")]
fn unresolvable_targets_are_rejected(#[case] target: &str) {
    let scene = Scene::new();
    scene.plugins.add("plugin");
    let err = scene
        .registry
        .register("plugin", target, returning(InterceptorKind::Mixed, 0))
        .expect_err("unresolvable");
    assert!(matches!(err, InterposeError::UnresolvedTarget { .. }));
}

#[test]
fn duplicate_registration_leaves_the_chain_unchanged() {
    let scene = Scene::new();
    scene.register("plugin", returning(InterceptorKind::Mixed, 2));
    let err = scene
        .registry
        .register("plugin", TARGET, returning(InterceptorKind::Passthrough, 3))
        .expect_err("duplicate");
    assert!(matches!(err, InterposeError::DuplicateRegistration { .. }));
    assert_eq!(scene.owners(), vec!["plugin"]);
    assert_eq!(scene.call(), json!(2));
}

#[test]
fn second_override_names_the_holder() {
    let scene = Scene::new();
    scene
        .plugins
        .insert("first", PluginInfo::new(true, "First Plugin"));
    scene
        .registry
        .register("first", TARGET, returning(InterceptorKind::Override, 1))
        .expect("first override");
    scene.plugins.add("second");

    let err = scene
        .registry
        .register("second", TARGET, returning(InterceptorKind::Override, 2))
        .expect_err("second override");
    assert_eq!(
        err.conflicting_owner_title(&*scene.plugins),
        Some(String::from("First Plugin"))
    );
    assert_eq!(scene.owners(), vec!["first"]);
}

#[rstest]
#[case::tolerated(false)]
#[case::reported(true)]
fn unregistering_an_absent_interceptor(#[case] fail_if_missing: bool) {
    let scene = Scene::new();
    scene.plugins.add("plugin");
    scene.register("other", returning(InterceptorKind::Mixed, 2));

    for target in [TARGET, "A.prototype.y"] {
        let outcome = scene.registry.unregister("plugin", target, fail_if_missing);
        if fail_if_missing {
            assert!(matches!(outcome, Err(InterposeError::NotFound { .. })));
        } else {
            assert!(outcome.is_ok());
        }
    }
    assert_eq!(scene.owners(), vec!["other"]);
}

#[test]
fn aliases_share_one_chain() {
    let scene = Scene::new();
    let class = scene
        .root
        .get("A")
        .and_then(|member| member.as_object().cloned())
        .expect("A is an object");
    scene
        .root
        .define("Alias", Member::Object(class))
        .expect("define alias");

    scene.register("first", returning(InterceptorKind::Passthrough, 1));
    scene.plugins.add("second");
    scene
        .registry
        .register("second", "Alias.prototype.x", returning(InterceptorKind::Mixed, 2))
        .expect("register through alias");

    assert_eq!(scene.registry.chain_count(), 1);
    let info = scene.registry.chain("Alias.prototype.x").expect("chain");
    assert_eq!(info.names, vec![TARGET, "x", "Alias.prototype.x"]);
    assert_eq!(info.owners, vec!["first", "second"]);
    assert_eq!(scene.registry.chain(TARGET), Some(info));

    scene
        .registry
        .unregister("second", TARGET, true)
        .expect("unregister through the other name");
    assert_eq!(scene.owners(), vec!["first"]);
}

#[test]
fn clear_module_removes_an_owner_everywhere() {
    let scene = Scene::new();
    scene
        .prototype
        .define_method("y", |_this, _args| Ok(json!("y")))
        .expect("define y");
    scene.register("keeper", returning(InterceptorKind::Mixed, 2));
    scene.register("leaver", returning(InterceptorKind::Passthrough, 3));
    scene
        .registry
        .register("leaver", "A.prototype.y", returning(InterceptorKind::Mixed, 4))
        .expect("register y");
    assert_eq!(scene.registry.chain_count(), 2);

    scene.registry.clear_module("leaver").expect("clear module");

    assert_eq!(scene.owners(), vec!["keeper"]);
    assert!(scene.registry.chain("A.prototype.y").is_none());
    assert_eq!(scene.registry.chain_count(), 1);
    assert_eq!(scene.instance.call("y", &[]).expect("call y"), json!("y"));
    assert_eq!(scene.call(), json!(2));
}

#[test]
fn clear_module_keeps_going_past_a_frozen_chain() {
    let scene = Scene::new();
    scene
        .prototype
        .define_method("y", |_this, _args| Ok(json!("y")))
        .expect("define y");
    scene.plugins.add("leaver");
    scene
        .registry
        .register("leaver", "A.prototype.y", returning(InterceptorKind::Mixed, 4))
        .expect("register y");
    scene.register("leaver", returning(InterceptorKind::Passthrough, 3));
    assert!(scene.prototype.freeze("y"));

    let err = scene
        .registry
        .clear_module("leaver")
        .expect_err("frozen chain cannot be restored");

    assert!(matches!(err, InterposeError::NotConfigurable { .. }));
    assert!(scene.owners().is_empty());
    assert_eq!(scene.call(), json!(1));
    let frozen = scene.registry.chain("A.prototype.y").expect("y still wrapped");
    assert_eq!(frozen.owners, vec!["leaver"]);
}

#[test]
fn clear_requires_an_existing_chain() {
    let scene = Scene::new();
    let err = scene.registry.clear(TARGET).expect_err("nothing to clear");
    assert!(matches!(err, InterposeError::ChainNotFound { .. }));

    scene.register("plugin", returning(InterceptorKind::Override, 2));
    scene.registry.clear(TARGET).expect("clear");
    assert!(scene.registry.chain(TARGET).is_none());
    assert_eq!(scene.call(), json!(1));
}

#[test]
fn introspection_reports_engine_state() {
    let scene = Scene::new();
    let registry = &scene.registry;
    assert_eq!(registry.version(), VERSION);
    assert_eq!(registry.kinds(), InterceptorKind::ALL);
    assert!(!registry.is_shim());
    assert!(registry.module_active());
    assert!(registry.properties_configurable());
    assert!(!registry.debug());

    registry.set_debug(true);
    assert!(scene.registry.debug(), "clones share debug state");

    scene.register("plugin", returning(InterceptorKind::Mixed, 2));
    let info = registry.chain(TARGET).expect("chain");
    assert_eq!(info.kinds, vec![InterceptorKind::Mixed]);
    assert!(info.installed);
    assert!(info.warned_owners.is_empty());
    assert!(registry.plugins().lookup("plugin").is_some());
}
