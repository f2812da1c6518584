//! Static types used by the type-checking pass (§4.3.4). This is a
//! compile-time-only sketch of the runtime's value tags — it exists to
//! validate declarations, assignments, and call sites, not to drive
//! dispatch (the VM is dynamically tagged, §3.4).

use via_core::Arena;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Ty<'a> {
    Auto,
    Nil,
    Int,
    Float,
    Bool,
    String,
    Array(&'a Ty<'a>),
    Dict(&'a Ty<'a>, &'a Ty<'a>),
    Function(&'a [Ty<'a>], &'a Ty<'a>),
    Optional(&'a Ty<'a>),
    /// A named type this pass does not resolve structurally (e.g. a
    /// user-defined struct name that has no declaration surface yet,
    /// §9's `struct`/`namespace` Open Question — reserved keywords only).
    Named(&'a str),
    /// Could not be determined; already-reported as a diagnostic upstream.
    Unknown,
}

impl<'a> Ty<'a> {
    #[must_use]
    pub fn primitive(name: &str) -> Option<Self> {
        Some(match name {
            "int" => Self::Int,
            "float" => Self::Float,
            "bool" => Self::Bool,
            "string" => Self::String,
            "nil" => Self::Nil,
            _ => return None,
        })
    }

    #[must_use]
    pub fn describe(&self, arena: &'a Arena) -> &'a str {
        match self {
            Self::Auto => "auto",
            Self::Nil => "nil",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Array(_) => arena.alloc_str("array"),
            Self::Dict(_, _) => arena.alloc_str("dict"),
            Self::Function(_, _) => arena.alloc_str("function"),
            Self::Optional(inner) => arena.alloc_str(&format!("{}?", inner.describe(arena))),
            Self::Named(name) => name,
            Self::Unknown => "unknown",
        }
    }
}

/// `compatible(inferred, T)` (§4.3.4): `T?` accepts `T` or `nil`, `int` and
/// `float` are mutually compatible, and everything else is structural.
#[must_use]
pub fn compatible(value: &Ty<'_>, target: &Ty<'_>) -> bool {
    match (value, target) {
        (_, Ty::Auto) | (Ty::Auto, _) | (_, Ty::Unknown) | (Ty::Unknown, _) => true,
        (Ty::Nil, Ty::Optional(_)) => true,
        (_, Ty::Optional(inner)) => compatible(value, inner),
        (Ty::Int, Ty::Float) | (Ty::Float, Ty::Int) => true,
        (Ty::Array(a), Ty::Array(b)) => compatible(a, b),
        (Ty::Dict(ak, av), Ty::Dict(bk, bv)) => compatible(ak, bk) && compatible(av, bv),
        (Ty::Function(ap, ar), Ty::Function(bp, br)) => {
            ap.len() == bp.len() && ap.iter().zip(bp.iter()).all(|(a, b)| compatible(a, b)) && compatible(ar, br)
        }
        _ => value == target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_float_are_mutually_compatible() {
        assert!(compatible(&Ty::Int, &Ty::Float));
        assert!(compatible(&Ty::Float, &Ty::Int));
    }

    #[test]
    fn optional_accepts_nil_or_inner() {
        let int_ty = Ty::Int;
        let opt = Ty::Optional(&int_ty);
        assert!(compatible(&Ty::Nil, &opt));
        assert!(compatible(&Ty::Int, &opt));
        assert!(!compatible(&Ty::String, &opt));
    }
}
