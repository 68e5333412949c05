use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::short_name;

type Erased = Arc<dyn Any + Send + Sync>;
type Provider = Arc<dyn Fn(&Injector) -> anyhow::Result<Erased> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum InjectorError {
    #[error("no binding for `{interface}`")]
    Unbound { interface: String },
    #[error("provider for `{interface}` failed: {source:#}")]
    Provider {
        interface: String,
        #[source]
        source: anyhow::Error,
    },
}

enum Binding {
    Instance(Erased),
    Transient(Provider),
    Singleton {
        provider: Provider,
        instance: Mutex<Option<Erased>>,
    },
}

struct Entry {
    interface: String,
    binding: Binding,
}

/// A group of bindings that can be installed into a [`Binder`].
pub trait Module: Send + Sync {
    fn configure(&self, binder: &mut Binder);
}

impl<F: Fn(&mut Binder) + Send + Sync> Module for F {
    fn configure(&self, binder: &mut Binder) {
        self(binder)
    }
}

/// Collects bindings from modules. Binding the same type twice keeps the last
/// binding.
#[derive(Default)]
pub struct Binder {
    bindings: HashMap<TypeId, Entry>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install<M: Module + ?Sized>(&mut self, module: &M) -> &mut Self {
        module.configure(self);
        self
    }

    pub fn is_bound<T: 'static>(&self) -> bool {
        self.bindings.contains_key(&TypeId::of::<T>())
    }

    /// Every resolution returns a clone of `value`.
    pub fn bind_instance<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.insert::<T>(Binding::Instance(Arc::new(value)))
    }

    /// The provider runs on every resolution.
    pub fn bind_provider<T, F>(&mut self, provider: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Injector) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T>(Binding::Transient(erase(provider)))
    }

    /// The provider runs on first resolution and its result is reused.
    pub fn bind_singleton<T, F>(&mut self, provider: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Injector) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.insert::<T>(Binding::Singleton {
            provider: erase(provider),
            instance: Mutex::new(None),
        })
    }

    /// Resolves `I` through the binding of `T`, so both share `T`'s scope.
    /// Typically used to expose a concrete `Arc<X>` as an `Arc<dyn Trait>`.
    pub fn bind_alias<I, T, F>(&mut self, convert: F) -> &mut Self
    where
        I: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> I + Send + Sync + 'static,
    {
        self.bind_provider::<I, _>(move |injector| Ok(convert(injector.get::<T>()?)))
    }

    /// Singleton `Arc<T>` built with [`Inject`].
    pub fn bind_injected<T: Inject + Send + Sync + 'static>(&mut self) -> &mut Self {
        self.bind_singleton::<Arc<T>, _>(|injector| Ok(Arc::new(T::inject(injector)?)))
    }

    fn insert<T: 'static>(&mut self, binding: Binding) -> &mut Self {
        let interface = short_name::<T>();
        if self.is_bound::<T>() {
            tracing::debug!("Replacing binding for `{interface}`");
        }
        self.bindings
            .insert(TypeId::of::<T>(), Entry { interface, binding });
        self
    }
}

fn erase<T, F>(provider: F) -> Provider
where
    T: Send + Sync + 'static,
    F: Fn(&Injector) -> anyhow::Result<T> + Send + Sync + 'static,
{
    Arc::new(move |injector| Ok(Arc::new(provider(injector)?) as Erased))
}

/// Resolves values by type from the bindings of its modules.
pub struct Injector {
    bindings: HashMap<TypeId, Entry>,
}

impl Injector {
    pub fn new(modules: &[&dyn Module]) -> Self {
        let mut binder = Binder::new();
        for module in modules {
            binder.install(*module);
        }
        Self::from_binder(binder)
    }

    pub fn from_binder(binder: Binder) -> Self {
        Self {
            bindings: binder.bindings,
        }
    }

    pub fn is_bound<T: 'static>(&self) -> bool {
        self.bindings.contains_key(&TypeId::of::<T>())
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Result<T, InjectorError> {
        let unbound = || InjectorError::Unbound {
            interface: short_name::<T>(),
        };
        let entry = self.bindings.get(&TypeId::of::<T>()).ok_or_else(unbound)?;
        let erased = match &entry.binding {
            Binding::Instance(value) => value.clone(),
            Binding::Transient(provider) => self.call(entry, provider)?,
            Binding::Singleton { provider, instance } => {
                let existing = instance.lock().clone();
                match existing {
                    Some(value) => value,
                    None => {
                        // the lock is released while the provider runs so it
                        // can resolve other singletons.
                        let created = self.call(entry, provider)?;
                        instance.lock().get_or_insert(created).clone()
                    }
                }
            }
        };
        erased.downcast_ref::<T>().cloned().ok_or_else(unbound)
    }

    pub fn inject<T: Inject>(&self) -> Result<T, InjectorError> {
        T::inject(self)
    }

    fn call(&self, entry: &Entry, provider: &Provider) -> Result<Erased, InjectorError> {
        provider(self).map_err(|source| InjectorError::Provider {
            interface: entry.interface.clone(),
            source,
        })
    }
}

/// A type that can be constructed from an [`Injector`]. Usually implemented
/// with the [`inject!`](crate::inject) macro.
pub trait Inject: Sized {
    fn inject(injector: &Injector) -> Result<Self, InjectorError>;
}

/// Defines a struct and implements [`Inject`] for it by resolving every field
/// from the injector.
#[macro_export]
macro_rules! inject {
    (
        $(#[$outer:meta])*
        $viz:vis struct $Name:ident {
            $($fviz:vis $field:ident: $FieldType:ty),*$(,)?
        }
    ) => {
        $(#[$outer])*
        $viz struct $Name {
            $($fviz $field: $FieldType),*
        }
        impl $crate::dependency_injection::Inject for $Name {
            fn inject(
                injector: &$crate::dependency_injection::Injector,
            ) -> Result<Self, $crate::dependency_injection::InjectorError> {
                Ok(Self { $($field: injector.get()?),* })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Repository: Send + Sync {
        fn name(&self) -> &str;
    }

    struct MemoryRepository(String);

    impl Repository for MemoryRepository {
        fn name(&self) -> &str {
            &self.0
        }
    }

    crate::inject!(
        struct Catalog {
            repository: Arc<dyn Repository>,
            label: String,
        }
    );

    #[test]
    fn alias_shares_singleton() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let module = move |binder: &mut Binder| {
            let counter = counter.clone();
            binder
                .bind_singleton::<Arc<MemoryRepository>, _>(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(MemoryRepository("memory".into())))
                })
                .bind_alias::<Arc<dyn Repository>, Arc<MemoryRepository>, _>(|r| r);
        };
        let injector = Injector::new(&[&module]);

        let concrete = injector.get::<Arc<MemoryRepository>>().unwrap();
        let abstracted = injector.get::<Arc<dyn Repository>>().unwrap();
        assert!(Arc::ptr_eq(
            &(concrete as Arc<dyn Repository>),
            &abstracted
        ));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_provider_runs_each_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut binder = Binder::new();
        binder.bind_provider::<usize, _>(move |_| Ok(counter.fetch_add(1, Ordering::SeqCst)));
        let injector = Injector::from_binder(binder);
        assert_eq!(injector.get::<usize>().unwrap(), 0);
        assert_eq!(injector.get::<usize>().unwrap(), 1);
    }

    #[test]
    fn unbound_type_is_named() {
        let injector = Injector::new(&[]);
        let err = injector.get::<Arc<dyn Repository>>().err().unwrap();
        assert!(matches!(err, InjectorError::Unbound { ref interface } if interface == "Arc<dyn Repository>"));
    }

    #[test]
    fn provider_failure_is_wrapped() {
        let mut binder = Binder::new();
        binder.bind_singleton::<String, _>(|_| anyhow::bail!("no database"));
        let err = Injector::from_binder(binder).get::<String>().unwrap_err();
        assert!(matches!(err, InjectorError::Provider { ref interface, .. } if interface == "String"));
        assert!(err.to_string().contains("no database"));
    }

    #[test]
    fn last_binding_wins() {
        let mut binder = Binder::new();
        binder.bind_instance(1u8).bind_instance(2u8);
        assert_eq!(Injector::from_binder(binder).get::<u8>().unwrap(), 2);
    }

    #[test]
    fn inject_macro_resolves_fields() {
        let mut binder = Binder::new();
        binder
            .bind_instance::<Arc<dyn Repository>>(Arc::new(MemoryRepository("memory".into())))
            .bind_instance("catalog".to_string())
            .bind_injected::<Catalog>();
        let injector = Injector::from_binder(binder);
        let catalog = injector.get::<Arc<Catalog>>().unwrap();
        assert_eq!(catalog.repository.name(), "memory");
        assert_eq!(catalog.label, "catalog");
        assert!(Arc::ptr_eq(&catalog, &injector.get::<Arc<Catalog>>().unwrap()));
    }

    #[test]
    fn inject_fails_on_missing_field() {
        let mut binder = Binder::new();
        binder.bind_instance("catalog".to_string());
        assert!(Injector::from_binder(binder).inject::<Catalog>().is_err());
    }
}
