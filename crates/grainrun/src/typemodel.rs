//! # Type Classifier
//!
//! Decides once per type how its values cross a connection: copied by value,
//! shared by reference through a proxy, or resolved as a process-wide singleton.
//!
//! Rust has no runtime reflection, so a type states its own shape through
//! [`Describe`]. The classifier turns that shape into a [`TypeDescription`]
//! and rejects inconsistent shapes when the type is first registered, never
//! at call time.
//!
//! ## Rules, in order
//! 1. Primitives and the built-in set (`String`, `str`, `decimal`, `()`) are
//!    by value, whatever else they declare.
//! 2. By-value and by-reference markers together are a conflict.
//! 3. By-value types collect their transferable members, including those of
//!    a non-root base type, which is described recursively.
//! 4. By-reference types implement exactly one by-reference interface.
//! 5. Otherwise exactly one singleton factory returning the type itself makes
//!    it a singleton.
//! 6. Anything else is not serializable.

use std::sync::Arc;

use dashmap::DashMap;

const BUILT_IN: &[&str] = &["String", "str", "decimal", "()"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("type {0} is marked both by-value and by-reference")]
    ConflictingSerializationMarkers(String),

    #[error("type {type_name} implements more than one by-reference interface: {interfaces:?}")]
    AmbiguousByReferenceInterface { type_name: String, interfaces: Vec<String> },

    #[error("type {0} is marked by-reference but implements no by-reference interface")]
    MissingByReferenceInterface(String),

    #[error("type {type_name} declares more than one singleton factory: {factories:?}")]
    MultipleSingletonFactories { type_name: String, factories: Vec<String> },

    #[error("singleton factory {factory} of {type_name} returns {returns}")]
    SingletonFactoryReturnType { type_name: String, factory: String, returns: String },

    #[error("singleton {type_name} also implements by-reference interface {interface}")]
    SingletonWithByReferenceInterface { type_name: String, interface: String },

    #[error("type {0} is neither by-value, by-reference nor a singleton")]
    NotSerializable(String),

    #[error("interface {interface} declares method {method} more than once")]
    DuplicateMethod { interface: String, method: String },
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Property,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberShape {
    pub name: String,
    pub kind: MemberKind,
    pub type_name: String,
    /// Excluded from transfer.
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InterfaceShape {
    name: String,
    by_reference: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FactoryShape {
    name: String,
    returns: String,
}

/// What a type declares about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeShape {
    name: String,
    primitive: bool,
    by_value: bool,
    by_reference: bool,
    members: Vec<MemberShape>,
    base: Option<Box<TypeShape>>,
    interfaces: Vec<InterfaceShape>,
    factories: Vec<FactoryShape>,
}

impl TypeShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primitive: false,
            by_value: false,
            by_reference: false,
            members: Vec::new(),
            base: None,
            interfaces: Vec::new(),
            factories: Vec::new(),
        }
    }

    pub fn primitive(name: impl Into<String>) -> Self {
        Self { primitive: true, ..Self::new(name) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn by_value(mut self) -> Self {
        self.by_value = true;
        self
    }

    pub fn by_reference(mut self) -> Self {
        self.by_reference = true;
        self
    }

    pub fn field(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.member(name, MemberKind::Field, type_name, false)
    }

    pub fn property(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.member(name, MemberKind::Property, type_name, false)
    }

    pub fn transient_field(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.member(name, MemberKind::Field, type_name, true)
    }

    fn member(mut self, name: impl Into<String>, kind: MemberKind, type_name: impl Into<String>, transient: bool) -> Self {
        self.members.push(MemberShape {
            name: name.into(),
            kind,
            type_name: type_name.into(),
            transient,
        });
        self
    }

    /// Declares a base type. Types without one derive from the root.
    pub fn base(mut self, base: TypeShape) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    pub fn base_of<B: Describe>(self) -> Self {
        self.base(B::shape())
    }

    /// Declares an implemented interface; `by_reference` marks it remotable.
    pub fn implements(mut self, name: impl Into<String>, by_reference: bool) -> Self {
        self.interfaces.push(InterfaceShape { name: name.into(), by_reference });
        self
    }

    pub fn singleton_factory(mut self, name: impl Into<String>, returns: impl Into<String>) -> Self {
        self.factories.push(FactoryShape { name: name.into(), returns: returns.into() });
        self
    }

    fn is_built_in(&self) -> bool {
        self.primitive || BUILT_IN.contains(&self.name.as_str())
    }

    fn by_reference_interfaces(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .filter(|i| i.by_reference)
            .map(|i| i.name.clone())
            .collect()
    }
}

/// Implemented by every type that crosses a connection.
pub trait Describe {
    fn shape() -> TypeShape;

    fn type_name() -> String {
        Self::shape().name
    }
}

macro_rules! describe_primitive {
    ($($t:ty),* $(,)?) => {
        $(
            impl Describe for $t {
                fn shape() -> TypeShape {
                    TypeShape::primitive(stringify!($t))
                }
            }
        )*
    };
}

describe_primitive!(bool, char, i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl Describe for i128 {
    fn shape() -> TypeShape {
        TypeShape::new("decimal")
    }
}

impl Describe for String {
    fn shape() -> TypeShape {
        TypeShape::new("String")
    }
}

impl Describe for () {
    fn shape() -> TypeShape {
        TypeShape::new("()")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    ByValue,
    ByReference { interface: String },
    Singleton { factory: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescription {
    pub name: String,
    pub kind: MemberKind,
    pub type_name: String,
}

/// Classification result for one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescription {
    pub name: String,
    pub kind: TypeKind,
    /// Members transferred for by-value types, own members only.
    pub members: Vec<MemberDescription>,
    pub base: Option<Arc<TypeDescription>>,
}

impl TypeDescription {
    pub fn is_by_value(&self) -> bool {
        self.kind == TypeKind::ByValue
    }

    /// Own and inherited members, base members first.
    pub fn all_members(&self) -> Vec<&MemberDescription> {
        let mut members = match &self.base {
            Some(base) => base.all_members(),
            None => Vec::new(),
        };
        members.extend(self.members.iter());
        members
    }
}

/// Caches classifications by type name.
#[derive(Default)]
pub struct TypeModel {
    types: DashMap<String, Arc<TypeDescription>>,
}

impl TypeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe<T: Describe + ?Sized>(&self) -> Result<Arc<TypeDescription>> {
        self.classify(&T::shape())
    }

    pub fn classify(&self, shape: &TypeShape) -> Result<Arc<TypeDescription>> {
        if let Some(existing) = self.types.get(&shape.name) {
            return Ok(existing.clone());
        }
        let description = Arc::new(classify(shape)?);
        Ok(self
            .types
            .entry(shape.name.clone())
            .or_insert(description)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Classifies a shape without caching.
pub fn classify(shape: &TypeShape) -> Result<TypeDescription> {
    if shape.is_built_in() {
        return Ok(TypeDescription {
            name: shape.name.clone(),
            kind: TypeKind::ByValue,
            members: Vec::new(),
            base: None,
        });
    }

    if shape.by_value && shape.by_reference {
        return Err(ClassifyError::ConflictingSerializationMarkers(shape.name.clone()));
    }

    if shape.by_value {
        return Ok(describe_by_value(shape));
    }

    let interfaces = shape.by_reference_interfaces();

    if shape.by_reference {
        return match interfaces.len() {
            0 => Err(ClassifyError::MissingByReferenceInterface(shape.name.clone())),
            1 => Ok(TypeDescription {
                name: shape.name.clone(),
                kind: TypeKind::ByReference { interface: interfaces[0].clone() },
                members: Vec::new(),
                base: None,
            }),
            _ => Err(ClassifyError::AmbiguousByReferenceInterface {
                type_name: shape.name.clone(),
                interfaces,
            }),
        };
    }

    match shape.factories.as_slice() {
        [] => Err(ClassifyError::NotSerializable(shape.name.clone())),
        [factory] => {
            if factory.returns != shape.name {
                return Err(ClassifyError::SingletonFactoryReturnType {
                    type_name: shape.name.clone(),
                    factory: factory.name.clone(),
                    returns: factory.returns.clone(),
                });
            }
            if let Some(interface) = interfaces.into_iter().next() {
                return Err(ClassifyError::SingletonWithByReferenceInterface {
                    type_name: shape.name.clone(),
                    interface,
                });
            }
            Ok(TypeDescription {
                name: shape.name.clone(),
                kind: TypeKind::Singleton { factory: factory.name.clone() },
                members: Vec::new(),
                base: None,
            })
        }
        many => Err(ClassifyError::MultipleSingletonFactories {
            type_name: shape.name.clone(),
            factories: many.iter().map(|f| f.name.clone()).collect(),
        }),
    }
}

fn describe_by_value(shape: &TypeShape) -> TypeDescription {
    let members = shape
        .members
        .iter()
        .filter(|m| !m.transient)
        .map(|m| MemberDescription {
            name: m.name.clone(),
            kind: m.kind,
            type_name: m.type_name.clone(),
        })
        .collect();

    TypeDescription {
        name: shape.name.clone(),
        kind: TypeKind::ByValue,
        members,
        base: shape.base.as_deref().map(|b| Arc::new(describe_by_value(b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_by_value_despite_markers() {
        for shape in [
            u32::shape(),
            String::shape(),
            <()>::shape(),
            i128::shape(),
            TypeShape::primitive("i32").by_reference().by_value().singleton_factory("f", "x"),
            TypeShape::new("String").by_reference().implements("IFoo", true),
        ] {
            let description = classify(&shape).unwrap();
            assert_eq!(description.kind, TypeKind::ByValue, "{}", shape.name());
        }
    }

    #[test]
    fn test_conflicting_markers_fail() {
        let shape = TypeShape::new("Widget").by_value().by_reference().implements("IWidget", true);
        assert_eq!(
            classify(&shape),
            Err(ClassifyError::ConflictingSerializationMarkers("Widget".into()))
        );
    }

    #[test]
    fn test_by_value_collects_inherited_members() {
        let base = TypeShape::new("Shape")
            .field("id", "u64")
            .transient_field("cache", "Vec<u8>");
        let shape = TypeShape::new("Circle")
            .by_value()
            .property("radius", "f64")
            .base(base);

        let description = classify(&shape).unwrap();
        let names: Vec<&str> = description.all_members().iter().map(|m| m.name.as_str()).collect();

        assert_eq!(names, ["id", "radius"]);
        assert_eq!(description.base.as_ref().map(|b| b.name.as_str()), Some("Shape"));
    }

    #[test]
    fn test_root_base_is_not_described() {
        let description = classify(&TypeShape::new("Point").by_value().field("x", "i32")).unwrap();
        assert!(description.base.is_none());
    }

    #[test]
    fn test_by_reference_needs_exactly_one_interface() {
        let none = TypeShape::new("Grain").by_reference().implements("Debug", false);
        assert_eq!(classify(&none), Err(ClassifyError::MissingByReferenceInterface("Grain".into())));

        let two = TypeShape::new("Grain")
            .by_reference()
            .implements("IA", true)
            .implements("IB", true);
        assert!(matches!(
            classify(&two),
            Err(ClassifyError::AmbiguousByReferenceInterface { interfaces, .. }) if interfaces == ["IA", "IB"]
        ));

        let one = TypeShape::new("Grain")
            .by_reference()
            .implements("Debug", false)
            .implements("IA", true);
        assert_eq!(
            classify(&one).unwrap().kind,
            TypeKind::ByReference { interface: "IA".into() }
        );
    }

    #[test]
    fn test_singleton_rules() {
        let ok = TypeShape::new("Clock").singleton_factory("instance", "Clock");
        assert_eq!(
            classify(&ok).unwrap().kind,
            TypeKind::Singleton { factory: "instance".into() }
        );

        let two = TypeShape::new("Clock")
            .singleton_factory("instance", "Clock")
            .singleton_factory("shared", "Clock");
        assert!(matches!(classify(&two), Err(ClassifyError::MultipleSingletonFactories { .. })));

        let wrong = TypeShape::new("Clock").singleton_factory("instance", "Other");
        assert!(matches!(classify(&wrong), Err(ClassifyError::SingletonFactoryReturnType { .. })));

        let remotable = TypeShape::new("Clock")
            .singleton_factory("instance", "Clock")
            .implements("IClock", true);
        assert!(matches!(
            classify(&remotable),
            Err(ClassifyError::SingletonWithByReferenceInterface { .. })
        ));
    }

    #[test]
    fn test_unmarked_type_is_not_serializable() {
        assert_eq!(
            classify(&TypeShape::new("Socket")),
            Err(ClassifyError::NotSerializable("Socket".into()))
        );
    }

    #[test]
    fn test_model_caches_by_name() {
        let model = TypeModel::new();
        let first = model.describe::<u64>().unwrap();
        let second = model.describe::<u64>().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(model.len(), 1);
    }
}
