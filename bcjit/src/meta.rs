//! The runtime metadata the compiler consumes: value kinds, constants, methods, types, fields and
//! constant pools, plus the two provider traits ([MetaAccess] and [ConstantReflection]) through
//! which the compiler asks the runtime about them.
//!
//! Everything in this module is immutable once created and is shared between concurrent
//! compilations via `Arc`s: the compiler never mutates runtime metadata.

use crate::compile::CompilationError;
use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};
use strum::Display;

/// The kind of a value as the abstract interpreter sees it.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Kind {
    #[strum(to_string = "z")]
    Boolean,
    #[strum(to_string = "b")]
    Byte,
    #[strum(to_string = "s")]
    Short,
    #[strum(to_string = "c")]
    Char,
    #[strum(to_string = "i")]
    Int,
    #[strum(to_string = "f")]
    Float,
    #[strum(to_string = "j")]
    Long,
    #[strum(to_string = "d")]
    Double,
    #[strum(to_string = "a")]
    Object,
    /// The value pushed by `jsr`.
    #[strum(to_string = "r")]
    ReturnAddress,
    #[strum(to_string = "v")]
    Void,
    #[strum(to_string = "-")]
    Illegal,
}

impl Kind {
    /// The kind this value has once loaded onto the operand stack: sub-word integers widen to
    /// [Kind::Int].
    pub fn stack_kind(self) -> Kind {
        match self {
            Kind::Boolean | Kind::Byte | Kind::Short | Kind::Char => Kind::Int,
            x => x,
        }
    }

    /// Does this kind occupy two local / stack slots?
    pub fn needs_two_slots(self) -> bool {
        matches!(self, Kind::Long | Kind::Double)
    }

    pub fn slot_count(self) -> usize {
        match self {
            Kind::Void => 0,
            x if x.needs_two_slots() => 2,
            _ => 1,
        }
    }

    pub fn is_numeric_integer(self) -> bool {
        matches!(
            self,
            Kind::Boolean | Kind::Byte | Kind::Short | Kind::Char | Kind::Int | Kind::Long
        )
    }

    pub fn is_numeric_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    /// The size of a value of this kind in bytes when stored in memory.
    pub fn byte_count(self) -> u32 {
        match self {
            Kind::Boolean | Kind::Byte => 1,
            Kind::Short | Kind::Char => 2,
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double | Kind::Object | Kind::ReturnAddress => 8,
            Kind::Void | Kind::Illegal => 0,
        }
    }

    /// Map a type descriptor character (`I`, `J`, `L` etc.) to a kind.
    pub fn from_type_char(c: char) -> Option<Kind> {
        match c {
            'Z' => Some(Kind::Boolean),
            'B' => Some(Kind::Byte),
            'S' => Some(Kind::Short),
            'C' => Some(Kind::Char),
            'I' => Some(Kind::Int),
            'F' => Some(Kind::Float),
            'J' => Some(Kind::Long),
            'D' => Some(Kind::Double),
            'L' | '[' => Some(Kind::Object),
            'V' => Some(Kind::Void),
            _ => None,
        }
    }

    /// Map the operand of a `newarray` instruction to the array's element kind.
    pub fn from_primitive_array_code(code: u8) -> Option<Kind> {
        match code {
            4 => Some(Kind::Boolean),
            5 => Some(Kind::Char),
            6 => Some(Kind::Float),
            7 => Some(Kind::Double),
            8 => Some(Kind::Byte),
            9 => Some(Kind::Short),
            10 => Some(Kind::Int),
            11 => Some(Kind::Long),
            _ => None,
        }
    }
}

/// A compile-time constant. Floating point values are stored as bit patterns so that constants
/// can be hashed and compared for value numbering without worrying about NaN.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Null,
    /// A reference to a heap object, identified by its address in the runtime.
    Object(u64),
    /// The return address pushed by a `jsr` instruction: the bci after the `jsr`.
    ReturnAddress(u32),
}

impl Constant {
    pub fn float(x: f32) -> Self {
        Constant::Float(x.to_bits())
    }

    pub fn double(x: f64) -> Self {
        Constant::Double(x.to_bits())
    }

    pub fn kind(&self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Null | Constant::Object(_) => Kind::Object,
            Constant::ReturnAddress(_) => Kind::ReturnAddress,
        }
    }

    /// If this is an integer constant, return it widened to an `i64`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Constant::Int(x) => Some(i64::from(*x)),
            Constant::Long(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Constant::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Constant::Null)
    }

    /// Is this the all-zero bit pattern for its kind?
    pub fn is_default_for_kind(&self) -> bool {
        match self {
            Constant::Int(x) => *x == 0,
            Constant::Long(x) => *x == 0,
            Constant::Float(x) => *x == 0,
            Constant::Double(x) => *x == 0,
            Constant::Null => true,
            Constant::Object(_) | Constant::ReturnAddress(_) => false,
        }
    }

    /// The zero value of `kind`.
    pub fn default_for_kind(kind: Kind) -> Option<Constant> {
        match kind.stack_kind() {
            Kind::Int => Some(Constant::Int(0)),
            Kind::Long => Some(Constant::Long(0)),
            Kind::Float => Some(Constant::Float(0)),
            Kind::Double => Some(Constant::Double(0)),
            Kind::Object => Some(Constant::Null),
            _ => None,
        }
    }
}

impl Display for Constant {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Constant::Int(x) => write!(f, "{x}i"),
            Constant::Long(x) => write!(f, "{x}L"),
            Constant::Float(x) => write!(f, "{:?}f", f32::from_bits(*x)),
            Constant::Double(x) => write!(f, "{:?}d", f64::from_bits(*x)),
            Constant::Null => write!(f, "null"),
            Constant::Object(x) => write!(f, "obj@{x:#x}"),
            Constant::ReturnAddress(x) => write!(f, "ret@{x}"),
        }
    }
}

/// A parsed method descriptor such as `(IJLjava/lang/Object;)V`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    pub descriptor: String,
    pub params: Vec<Kind>,
    pub ret: Kind,
}

impl Signature {
    pub fn parse(descriptor: &str) -> Result<Self, CompilationError> {
        let malformed = || CompilationError::Bailout(format!("malformed descriptor '{descriptor}'"));
        let mut chars = descriptor.chars().peekable();
        if chars.next() != Some('(') {
            return Err(malformed());
        }
        let mut params = Vec::new();
        loop {
            let Some(c) = chars.next() else {
                return Err(malformed());
            };
            if c == ')' {
                break;
            }
            params.push(Self::parse_field_type(c, &mut chars).ok_or_else(malformed)?);
        }
        let c = chars.next().ok_or_else(malformed)?;
        let ret = Self::parse_field_type(c, &mut chars).ok_or_else(malformed)?;
        if chars.next().is_some() {
            return Err(malformed());
        }
        Ok(Signature {
            descriptor: descriptor.to_owned(),
            params,
            ret,
        })
    }

    /// Parse one field type whose first character `c` has already been consumed.
    fn parse_field_type(
        c: char,
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    ) -> Option<Kind> {
        match c {
            'L' => {
                for x in chars.by_ref() {
                    if x == ';' {
                        return Some(Kind::Object);
                    }
                }
                None
            }
            '[' => {
                let next = chars.next()?;
                Self::parse_field_type(next, chars)?;
                Some(Kind::Object)
            }
            c => Kind::from_type_char(c),
        }
    }

    /// How many local slots do the parameters take up, including the receiver if `receiver` is
    /// true?
    pub fn arg_slots(&self, receiver: bool) -> usize {
        self.params.iter().map(|k| k.slot_count()).sum::<usize>() + usize::from(receiver)
    }
}

/// A type whose layout is known to the runtime.
#[derive(Debug)]
pub struct ResolvedType {
    /// The type's internal name, e.g. `java/lang/String`.
    pub name: String,
    /// The address of the type's metadata, i.e. the value stored in every instance's header.
    pub hub: u64,
    /// The address of the type's mirror object (what `ldc` of a class pushes).
    pub mirror: u64,
    /// Can this type have subtypes? If not, type checks reduce to a hub comparison.
    pub is_final: bool,
    pub is_interface: bool,
    /// For array types, the element kind.
    pub element_kind: Option<Kind>,
    pub instance_size: u32,
}

impl ResolvedType {
    pub fn is_array(&self) -> bool {
        self.element_kind.is_some()
    }
}

#[derive(Debug)]
pub struct ResolvedField {
    pub holder: Arc<ResolvedType>,
    pub name: String,
    pub kind: Kind,
    pub offset: u32,
    pub is_static: bool,
    pub is_final: bool,
}

/// An entry in a method's exception table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExceptionHandler {
    pub start_bci: u32,
    /// Exclusive.
    pub end_bci: u32,
    pub handler_bci: u32,
    /// The constant pool index of the caught type or 0 for a catch-all handler.
    pub catch_type_cpi: u16,
}

impl ExceptionHandler {
    pub fn is_catch_all(&self) -> bool {
        self.catch_type_cpi == 0
    }

    pub fn covers(&self, bci: u32) -> bool {
        self.start_bci <= bci && bci < self.end_bci
    }
}

/// A method with bytecode that can be compiled.
#[derive(Debug)]
pub struct ResolvedMethod {
    pub holder: Arc<ResolvedType>,
    pub name: String,
    pub signature: Signature,
    pub code: Vec<u8>,
    pub max_locals: u16,
    pub max_stack: u16,
    pub handlers: Vec<ExceptionHandler>,
    pub cpool: Arc<ConstantPool>,
    pub is_static: bool,
    pub is_synchronized: bool,
    /// Is this method never overridden (private, final, static, or a constructor)?
    pub can_be_statically_bound: bool,
    /// The address of the method's compiled or interpreted entry point.
    pub entry: u64,
}

impl ResolvedMethod {
    /// Return a human readable name such as `Foo.bar(I)V`.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}{}",
            self.holder.name, self.name, self.signature.descriptor
        )
    }

    /// The kinds of this method's incoming arguments, including the receiver.
    pub fn arg_kinds(&self) -> Vec<Kind> {
        let mut kinds = Vec::with_capacity(self.signature.params.len() + 1);
        if !self.is_static {
            kinds.push(Kind::Object);
        }
        kinds.extend(self.signature.params.iter().map(|k| k.stack_kind()));
        kinds
    }
}

/// A type that is either known to the runtime or only known by name.
#[derive(Clone, Debug)]
pub enum JavaType {
    Resolved(Arc<ResolvedType>),
    Unresolved(String),
}

impl JavaType {
    pub fn name(&self) -> &str {
        match self {
            JavaType::Resolved(t) => &t.name,
            JavaType::Unresolved(n) => n,
        }
    }
}

impl PartialEq for JavaType {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for JavaType {}

impl Hash for JavaType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state)
    }
}

#[derive(Clone, Debug)]
pub enum JavaField {
    Resolved(Arc<ResolvedField>),
    Unresolved { holder: String, name: String, kind: Kind },
}

impl JavaField {
    pub fn kind(&self) -> Kind {
        match self {
            JavaField::Resolved(f) => f.kind,
            JavaField::Unresolved { kind, .. } => *kind,
        }
    }
}

#[derive(Clone, Debug)]
pub enum JavaMethod {
    Resolved(Arc<ResolvedMethod>),
    Unresolved {
        holder: String,
        name: String,
        signature: Signature,
    },
}

impl JavaMethod {
    pub fn signature(&self) -> &Signature {
        match self {
            JavaMethod::Resolved(m) => &m.signature,
            JavaMethod::Unresolved { signature, .. } => signature,
        }
    }
}

/// What `ldc` and friends can load.
#[derive(Clone, Debug)]
pub enum LoadableConstant {
    Value(Constant),
    Type(JavaType),
}

/// A constant pool entry. Symbolic references name their targets: resolution is the job of the
/// [MetaAccess] provider.
#[derive(Clone, Debug, PartialEq)]
pub enum PoolEntry {
    /// Index 0 of every pool.
    Empty,
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    /// A string literal, already interned by the runtime at the given address.
    String(u64),
    Class(String),
    Field {
        holder: String,
        name: String,
        descriptor: String,
    },
    Method {
        holder: String,
        name: String,
        descriptor: String,
    },
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    pub entries: Vec<PoolEntry>,
}

impl ConstantPool {
    pub fn new(entries: Vec<PoolEntry>) -> Self {
        let mut all = vec![PoolEntry::Empty];
        all.extend(entries);
        ConstantPool { entries: all }
    }

    pub fn get(&self, cpi: u16) -> Result<&PoolEntry, CompilationError> {
        self.entries
            .get(usize::from(cpi))
            .ok_or_else(|| CompilationError::Bailout(format!("constant pool index {cpi} out of range")))
    }
}

/// The runtime's method / type / field metadata provider.
pub trait MetaAccess: Send + Sync {
    fn lookup_constant(&self, cpool: &ConstantPool, cpi: u16)
        -> Result<LoadableConstant, CompilationError>;
    fn lookup_type(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaType, CompilationError>;
    fn lookup_field(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaField, CompilationError>;
    fn lookup_method(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaMethod, CompilationError>;
    /// Look up a well-known type by name (e.g. exception classes raised by the compiled code).
    fn lookup_type_by_name(&self, name: &str) -> JavaType;
}

/// Folds reads of runtime state that can be known at compile time. `None` means "unknown": the
/// compiler then emits the read.
pub trait ConstantReflection: Send + Sync {
    fn read_array_length(&self, array: &Constant) -> Option<i32>;
    fn read_static_final_field(&self, field: &ResolvedField) -> Option<Constant>;
    /// The object that static fields of `holder` are addressed relative to.
    fn static_base(&self, holder: &ResolvedType) -> Option<Constant>;
}

/// A [MetaAccess] that resolves symbolic references against a fixed registry of types, fields
/// and methods. Anything not registered is unresolved.
#[derive(Debug, Default)]
pub struct Registry {
    types: HashMap<String, Arc<ResolvedType>>,
    fields: HashMap<(String, String), Arc<ResolvedField>>,
    methods: HashMap<(String, String, String), Arc<ResolvedMethod>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: Arc<ResolvedType>) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn add_field(&mut self, field: Arc<ResolvedField>) {
        self.fields
            .insert((field.holder.name.clone(), field.name.clone()), field);
    }

    pub fn add_method(&mut self, method: Arc<ResolvedMethod>) {
        self.methods.insert(
            (
                method.holder.name.clone(),
                method.name.clone(),
                method.signature.descriptor.clone(),
            ),
            method,
        );
    }

    fn type_named(&self, name: &str) -> JavaType {
        match self.types.get(name) {
            Some(t) => JavaType::Resolved(Arc::clone(t)),
            None => JavaType::Unresolved(name.to_owned()),
        }
    }
}

impl MetaAccess for Registry {
    fn lookup_constant(
        &self,
        cpool: &ConstantPool,
        cpi: u16,
    ) -> Result<LoadableConstant, CompilationError> {
        Ok(match cpool.get(cpi)? {
            PoolEntry::Int(x) => LoadableConstant::Value(Constant::Int(*x)),
            PoolEntry::Float(x) => LoadableConstant::Value(Constant::float(*x)),
            PoolEntry::Long(x) => LoadableConstant::Value(Constant::Long(*x)),
            PoolEntry::Double(x) => LoadableConstant::Value(Constant::double(*x)),
            PoolEntry::String(addr) => LoadableConstant::Value(Constant::Object(*addr)),
            PoolEntry::Class(name) => LoadableConstant::Type(self.type_named(name)),
            x => {
                return Err(CompilationError::Bailout(format!(
                    "constant pool entry {cpi} is not loadable: {x:?}"
                )))
            }
        })
    }

    fn lookup_type(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaType, CompilationError> {
        match cpool.get(cpi)? {
            PoolEntry::Class(name) => Ok(self.type_named(name)),
            x => Err(CompilationError::Bailout(format!(
                "constant pool entry {cpi} is not a class: {x:?}"
            ))),
        }
    }

    fn lookup_field(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaField, CompilationError> {
        match cpool.get(cpi)? {
            PoolEntry::Field {
                holder,
                name,
                descriptor,
            } => {
                if let Some(f) = self.fields.get(&(holder.clone(), name.clone())) {
                    return Ok(JavaField::Resolved(Arc::clone(f)));
                }
                let kind = descriptor
                    .chars()
                    .next()
                    .and_then(Kind::from_type_char)
                    .ok_or_else(|| {
                        CompilationError::Bailout(format!("malformed field descriptor '{descriptor}'"))
                    })?;
                Ok(JavaField::Unresolved {
                    holder: holder.clone(),
                    name: name.clone(),
                    kind,
                })
            }
            x => Err(CompilationError::Bailout(format!(
                "constant pool entry {cpi} is not a field: {x:?}"
            ))),
        }
    }

    fn lookup_method(&self, cpool: &ConstantPool, cpi: u16) -> Result<JavaMethod, CompilationError> {
        match cpool.get(cpi)? {
            PoolEntry::Method {
                holder,
                name,
                descriptor,
            } => {
                let key = (holder.clone(), name.clone(), descriptor.clone());
                if let Some(m) = self.methods.get(&key) {
                    return Ok(JavaMethod::Resolved(Arc::clone(m)));
                }
                Ok(JavaMethod::Unresolved {
                    holder: holder.clone(),
                    name: name.clone(),
                    signature: Signature::parse(descriptor)?,
                })
            }
            x => Err(CompilationError::Bailout(format!(
                "constant pool entry {cpi} is not a method: {x:?}"
            ))),
        }
    }

    fn lookup_type_by_name(&self, name: &str) -> JavaType {
        self.type_named(name)
    }
}

/// A [ConstantReflection] over a snapshot of (part of) the runtime heap.
#[derive(Debug, Default)]
pub struct HeapSnapshot {
    pub array_lengths: HashMap<u64, i32>,
    pub static_finals: HashMap<(String, String), Constant>,
    pub static_bases: HashMap<String, u64>,
}

impl ConstantReflection for HeapSnapshot {
    fn read_array_length(&self, array: &Constant) -> Option<i32> {
        match array {
            Constant::Object(addr) => self.array_lengths.get(addr).copied(),
            _ => None,
        }
    }

    fn read_static_final_field(&self, field: &ResolvedField) -> Option<Constant> {
        if !field.is_static || !field.is_final {
            return None;
        }
        self.static_finals
            .get(&(field.holder.name.clone(), field.name.clone()))
            .copied()
    }

    fn static_base(&self, holder: &ResolvedType) -> Option<Constant> {
        self.static_bases
            .get(&holder.name)
            .map(|addr| Constant::Object(*addr))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Build a type called `name` for testing purposes.
    pub(crate) fn test_type(name: &str, hub: u64) -> Arc<ResolvedType> {
        Arc::new(ResolvedType {
            name: name.to_owned(),
            hub,
            mirror: hub + 0x8,
            is_final: false,
            is_interface: false,
            element_kind: None,
            instance_size: 16,
        })
    }

    #[test]
    fn kinds() {
        assert_eq!(Kind::Byte.stack_kind(), Kind::Int);
        assert_eq!(Kind::Long.stack_kind(), Kind::Long);
        assert!(Kind::Double.needs_two_slots());
        assert!(!Kind::Object.needs_two_slots());
        assert_eq!(Kind::from_primitive_array_code(10), Some(Kind::Int));
        assert_eq!(Kind::from_primitive_array_code(3), None);
    }

    #[test]
    fn signatures() {
        let s = Signature::parse("(IJ[Ljava/lang/String;D)Z").unwrap();
        assert_eq!(
            s.params,
            vec![Kind::Int, Kind::Long, Kind::Object, Kind::Double]
        );
        assert_eq!(s.ret, Kind::Boolean);
        assert_eq!(s.arg_slots(false), 6);
        assert_eq!(s.arg_slots(true), 7);
        assert_eq!(Signature::parse("()V").unwrap().params, vec![]);
        for bad in ["", "I)V", "(I", "(Ljava/lang/Object)V", "(I)VV", "(Q)V"] {
            assert!(matches!(
                Signature::parse(bad),
                Err(CompilationError::Bailout(_))
            ));
        }
    }

    #[test]
    fn constants() {
        assert_eq!(Constant::Int(3).as_long(), Some(3));
        assert!(Constant::double(0.0).is_default_for_kind());
        assert!(!Constant::double(-0.0).is_default_for_kind());
        assert_eq!(Constant::float(1.5).to_string(), "1.5f");
        assert_eq!(Constant::Long(-2).to_string(), "-2L");
        assert_eq!(Constant::default_for_kind(Kind::Char), Some(Constant::Int(0)));
    }

    #[test]
    fn registry_resolution() {
        let mut r = Registry::new();
        let t = test_type("A", 0x1000);
        r.add_type(Arc::clone(&t));
        r.add_field(Arc::new(ResolvedField {
            holder: Arc::clone(&t),
            name: "f".to_owned(),
            kind: Kind::Int,
            offset: 12,
            is_static: false,
            is_final: false,
        }));
        let cp = ConstantPool::new(vec![
            PoolEntry::Class("A".to_owned()),
            PoolEntry::Class("B".to_owned()),
            PoolEntry::Field {
                holder: "A".to_owned(),
                name: "f".to_owned(),
                descriptor: "I".to_owned(),
            },
            PoolEntry::Field {
                holder: "A".to_owned(),
                name: "g".to_owned(),
                descriptor: "J".to_owned(),
            },
            PoolEntry::Long(7),
        ]);
        assert!(matches!(r.lookup_type(&cp, 1), Ok(JavaType::Resolved(_))));
        assert!(matches!(r.lookup_type(&cp, 2), Ok(JavaType::Unresolved(ref n)) if n == "B"));
        assert!(matches!(r.lookup_field(&cp, 3), Ok(JavaField::Resolved(_))));
        match r.lookup_field(&cp, 4).unwrap() {
            JavaField::Unresolved { kind, .. } => assert_eq!(kind, Kind::Long),
            _ => panic!(),
        }
        assert!(matches!(
            r.lookup_constant(&cp, 5),
            Ok(LoadableConstant::Value(Constant::Long(7)))
        ));
        assert!(r.lookup_type(&cp, 9).is_err());
    }
}
