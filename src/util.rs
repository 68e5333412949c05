use std::sync::OnceLock;

use regex::Regex;

/// Type name without module paths, used to name bindings in errors and logs.
pub fn short_name<T: ?Sized>() -> String {
    abs_to_rel_paths(std::any::type_name::<T>())
}

fn abs_to_rel_paths(s: &str) -> String {
    static PATH_SEGMENT: OnceLock<Regex> = OnceLock::new();
    PATH_SEGMENT
        .get_or_init(|| Regex::new("[_a-zA-Z0-9]*::").expect("path segment pattern is valid"))
        .replace_all(s, "")
        .into()
}

#[test]
fn abs_to_rel_paths_works() {
    assert_eq!(
        "Arc<dyn ApplicationView>",
        abs_to_rel_paths("alloc::sync::Arc<dyn app_factory::plugin::ApplicationView>")
    );
    assert_eq!(
        "Arc<GenericApplicationModule<Books, ApplicationConfig>>",
        abs_to_rel_paths("alloc::sync::Arc<app_factory::module::GenericApplicationModule<books::Books, app_factory::application::ApplicationConfig>>")
    );
    assert_eq!(
        "(Arc<TelemetryConfig>, Arc<Telemetry>)",
        abs_to_rel_paths("(alloc::sync::Arc<app_factory::plugins::telemetry::TelemetryConfig>, alloc::sync::Arc<app_factory::plugins::telemetry::Telemetry>)")
    );
    assert_eq!("String", abs_to_rel_paths("alloc::string::String"));
    assert_eq!("u16", abs_to_rel_paths("u16"));
}
