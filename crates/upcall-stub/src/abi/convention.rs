use std::fmt;

use super::descriptor::ConventionDescriptor;
use super::register::{Location, RegKind, Register, StackArea};
use super::{RET_BUF_GP_SLOT, RET_BUF_VECTOR_SLOT, STACK_ARG_SIZE};
use crate::{Error, Result};

/// Value types that can cross the native/runtime boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    /// Raw native pointer.
    Address,
    /// Managed reference. Only the receiver has this type.
    Object,
    Void,
}

impl BasicType {
    #[must_use]
    pub const fn from_descriptor_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => Self::Boolean,
            'B' => Self::Byte,
            'S' => Self::Short,
            'C' => Self::Char,
            'I' => Self::Int,
            'J' => Self::Long,
            'F' => Self::Float,
            'D' => Self::Double,
            'A' => Self::Address,
            'L' => Self::Object,
            'V' => Self::Void,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn descriptor_char(self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Short => 'S',
            Self::Char => 'C',
            Self::Int => 'I',
            Self::Long => 'J',
            Self::Float => 'F',
            Self::Double => 'D',
            Self::Address => 'A',
            Self::Object => 'L',
            Self::Void => 'V',
        }
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Register class a value of this type travels in; `None` for `Void`.
    #[must_use]
    pub const fn reg_kind(self) -> Option<RegKind> {
        match self {
            Self::Void => None,
            Self::Float | Self::Double => Some(RegKind::Fp),
            _ => Some(RegKind::Gp),
        }
    }
}

/// Argument types plus the types of the native return registers, in order.
///
/// Textual form: `(IJD)J`. A result spread over several return registers is
/// written as a bracketed list, e.g. `(I)[JJ]`; `V` means no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    args: Vec<BasicType>,
    returns: Vec<BasicType>,
}

impl Signature {
    /// Native callers cannot pass managed references, and every return
    /// register must carry a primitive or address.
    pub fn new(args: Vec<BasicType>, returns: Vec<BasicType>) -> Result<Self> {
        if let Some(ty) = args
            .iter()
            .find(|ty| matches!(ty, BasicType::Void | BasicType::Object))
        {
            return Err(Error::InvalidSignature(format!(
                "argument type {ty:?} cannot be passed by a native caller"
            )));
        }
        if let Some(&ty) = returns
            .iter()
            .find(|ty| matches!(ty, BasicType::Void | BasicType::Object))
        {
            return Err(Error::UnsupportedReturnType(ty));
        }
        Ok(Self { args, returns })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidSignature(format!("'{text}': {why}"));
        let rest = text
            .trim()
            .strip_prefix('(')
            .ok_or_else(|| invalid("expected '('"))?;
        let (args_text, ret_text) = rest
            .split_once(')')
            .ok_or_else(|| invalid("expected ')'"))?;

        let parse_types = |s: &str| -> Result<Vec<BasicType>> {
            s.chars()
                .map(|c| {
                    BasicType::from_descriptor_char(c)
                        .ok_or_else(|| invalid(&format!("unknown type character '{c}'")))
                })
                .collect()
        };

        let args = parse_types(args_text)?;
        let returns = if let Some(group) = ret_text.strip_prefix('[') {
            let inner = group
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated return register list"))?;
            parse_types(inner)?
        } else {
            match parse_types(ret_text)?.as_slice() {
                [BasicType::Void] => Vec::new(),
                [ty] => vec![*ty],
                _ => return Err(invalid("expected a single return type")),
            }
        };
        Self::new(args, returns)
    }

    #[must_use]
    pub fn args(&self) -> &[BasicType] {
        &self.args
    }

    #[must_use]
    pub fn returns(&self) -> &[BasicType] {
        &self.returns
    }

    /// The return type of the managed method as it sees itself. Results that
    /// span several registers are written through a return buffer, so the
    /// method itself returns nothing.
    #[must_use]
    pub fn declared_return(&self) -> BasicType {
        match self.returns.as_slice() {
            [ty] => *ty,
            _ => BasicType::Void,
        }
    }

    /// Bytes needed to hold every return register in a return buffer.
    #[must_use]
    pub fn return_buffer_bytes(&self) -> usize {
        self.returns
            .iter()
            .map(|ty| {
                if ty.is_floating() {
                    RET_BUF_VECTOR_SLOT
                } else {
                    RET_BUF_GP_SLOT
                }
            })
            .sum()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for ty in &self.args {
            write!(f, "{}", ty.descriptor_char())?;
        }
        f.write_str(")")?;
        match self.returns.as_slice() {
            [] => f.write_str("V"),
            [ty] => write!(f, "{}", ty.descriptor_char()),
            many => {
                f.write_str("[")?;
                for ty in many {
                    write!(f, "{}", ty.descriptor_char())?;
                }
                f.write_str("]")
            }
        }
    }
}

/// One logical argument (or return value) and where it physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub index: usize,
    pub ty: BasicType,
    pub location: Location,
}

/// Ordered assignment of logical slots to physical locations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallingConvention {
    slots: Vec<ArgSlot>,
}

impl CallingConvention {
    /// Assign `types` to `desc`'s argument registers in order; values that do
    /// not fit in registers go to consecutive 8-byte slots in `area`.
    #[must_use]
    pub fn arguments(desc: &ConventionDescriptor, types: &[BasicType], area: StackArea) -> Self {
        let mut next_int = desc.int_args().iter();
        let mut next_float = desc.float_args().iter();
        let mut stack_offset = 0i32;

        let slots = types
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                let reg = if ty.is_floating() {
                    next_float.next()
                } else {
                    next_int.next()
                };
                let location = if let Some(&reg) = reg {
                    Location::Reg(reg)
                } else {
                    let slot = Location::Stack {
                        area,
                        offset: stack_offset,
                    };
                    stack_offset += STACK_ARG_SIZE as i32;
                    slot
                };
                ArgSlot {
                    index,
                    ty,
                    location,
                }
            })
            .collect();
        Self { slots }
    }

    /// Assign return register types to `desc`'s return registers. Returns
    /// never spill to the stack.
    pub fn returns(desc: &ConventionDescriptor, types: &[BasicType]) -> Result<Self> {
        let mut next_int = desc.int_returns().iter();
        let mut next_float = desc.float_returns().iter();
        let slots = types
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                let reg = if ty.is_floating() {
                    next_float.next()
                } else {
                    next_int.next()
                };
                let reg = reg.ok_or_else(|| {
                    Error::InvalidSignature(format!(
                        "{}: not enough return registers for {} values",
                        desc.name(),
                        types.len()
                    ))
                })?;
                Ok(ArgSlot {
                    index,
                    ty,
                    location: Location::Reg(*reg),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { slots })
    }

    /// Build a convention from explicit locations, as handed over by a caller
    /// that already computed the native placement.
    #[must_use]
    pub fn from_locations(locations: impl IntoIterator<Item = (BasicType, Location)>) -> Self {
        let slots = locations
            .into_iter()
            .enumerate()
            .map(|(index, (ty, location))| ArgSlot {
                index,
                ty,
                location,
            })
            .collect();
        Self { slots }
    }

    #[must_use]
    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.slots.iter().map(|slot| slot.location)
    }

    /// Register-resident slots, in slot order.
    #[must_use]
    pub fn registers(&self) -> Vec<Register> {
        self.locations().filter_map(Location::as_reg).collect()
    }

    /// Split off the first slot (the receiver on the runtime side). The
    /// remaining slots are renumbered from zero.
    #[must_use]
    pub fn split_first(&self) -> Option<(ArgSlot, Self)> {
        let (first, rest) = self.slots.split_first()?;
        let rest = Self::from_locations(rest.iter().map(|slot| (slot.ty, slot.location)));
        Some((*first, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        let sig = Signature::parse("(IJD)J").unwrap();
        assert_eq!(
            sig.args(),
            &[BasicType::Int, BasicType::Long, BasicType::Double]
        );
        assert_eq!(sig.returns(), &[BasicType::Long]);
        assert_eq!(sig.to_string(), "(IJD)J");
    }

    #[test]
    fn test_parse_void_and_multi_register_returns() {
        assert!(Signature::parse("()V").unwrap().returns().is_empty());
        let sig = Signature::parse("(A)[JD]").unwrap();
        assert_eq!(sig.returns(), &[BasicType::Long, BasicType::Double]);
        assert_eq!(sig.declared_return(), BasicType::Void);
        assert_eq!(sig.return_buffer_bytes(), 8 + 16);
        assert_eq!(sig.to_string(), "(A)[JD]");
    }

    #[test]
    fn test_parse_rejects_object_return() {
        let err = Signature::parse("(I)L").unwrap_err();
        assert!(matches!(err, Error::UnsupportedReturnType(BasicType::Object)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Signature::parse("IJ)V").is_err());
        assert!(Signature::parse("(IQ)V").is_err());
        assert!(Signature::parse("(I)[JJ").is_err());
        assert!(Signature::parse("(L)V").is_err());
    }

    #[test]
    fn test_argument_assignment_overflows_to_stack() {
        let desc = ConventionDescriptor::builder("two-regs")
            .int_args([Register::gp(0), Register::gp(1)])
            .float_args([Register::fp(0)])
            .build()
            .unwrap();
        let types = [
            BasicType::Int,
            BasicType::Double,
            BasicType::Long,
            BasicType::Int,
            BasicType::Float,
        ];
        let conv = CallingConvention::arguments(&desc, &types, StackArea::Outgoing);
        let locs: Vec<_> = conv.locations().collect();
        assert_eq!(
            locs,
            vec![
                Location::Reg(Register::gp(0)),
                Location::Reg(Register::fp(0)),
                Location::Reg(Register::gp(1)),
                Location::outgoing(0),
                Location::outgoing(8),
            ]
        );
        assert_eq!(conv.registers().len(), 3);
    }

    #[test]
    fn test_returns_do_not_spill() {
        let desc = ConventionDescriptor::aarch64_runtime();
        let err = CallingConvention::returns(&desc, &[BasicType::Long, BasicType::Long]);
        assert!(err.is_err());
        let ok = CallingConvention::returns(&desc, &[BasicType::Double]).unwrap();
        assert_eq!(ok.registers(), vec![Register::fp(0)]);
    }

    #[test]
    fn test_split_first_renumbers() {
        let conv = CallingConvention::from_locations([
            (BasicType::Object, Location::Reg(Register::gp(1))),
            (BasicType::Int, Location::Reg(Register::gp(2))),
        ]);
        let (receiver, rest) = conv.split_first().unwrap();
        assert_eq!(receiver.location, Location::Reg(Register::gp(1)));
        assert_eq!(rest.slots()[0].index, 0);
        assert_eq!(rest.len(), 1);
    }
}
