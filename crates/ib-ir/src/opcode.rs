use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // Terminators
    Ret,
    Br,
    Switch,
    IndirectBr,
    Invoke,
    Resume,
    Unreachable,
    CleanupRet,
    CatchRet,
    CatchSwitch,
    CallBr,

    // Unary
    FNeg,

    // Binary
    Add,
    FAdd,
    Sub,
    FSub,
    Mul,
    FMul,
    UDiv,
    SDiv,
    FDiv,
    URem,
    SRem,
    FRem,

    // Bitwise
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,

    // Memory
    Alloca,
    Load,
    Store,
    GetElementPtr,
    Fence,
    AtomicCmpXchg,
    AtomicRMW,

    // Casts
    Trunc,
    ZExt,
    SExt,
    FPToUI,
    FPToSI,
    UIToFP,
    SIToFP,
    FPTrunc,
    FPExt,
    PtrToInt,
    IntToPtr,
    BitCast,
    AddrSpaceCast,

    // Other
    ICmp,
    FCmp,
    Phi,
    Call,
    Select,
    UserOp1,
    UserOp2,
    VAArg,
    ExtractElement,
    InsertElement,
    ShuffleVector,
    ExtractValue,
    InsertValue,
    LandingPad,
    CleanupPad,
    CatchPad,
    Freeze,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Ret
                | Opcode::Br
                | Opcode::Switch
                | Opcode::IndirectBr
                | Opcode::Invoke
                | Opcode::Resume
                | Opcode::Unreachable
                | Opcode::CleanupRet
                | Opcode::CatchRet
                | Opcode::CatchSwitch
                | Opcode::CallBr
        )
    }

    pub fn is_cast(self) -> bool {
        matches!(
            self,
            Opcode::Trunc
                | Opcode::ZExt
                | Opcode::SExt
                | Opcode::FPToUI
                | Opcode::FPToSI
                | Opcode::UIToFP
                | Opcode::SIToFP
                | Opcode::FPTrunc
                | Opcode::FPExt
                | Opcode::PtrToInt
                | Opcode::IntToPtr
                | Opcode::BitCast
                | Opcode::AddrSpaceCast
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Ret => "ret",
            Opcode::Br => "br",
            Opcode::Switch => "switch",
            Opcode::IndirectBr => "indirectbr",
            Opcode::Invoke => "invoke",
            Opcode::Resume => "resume",
            Opcode::Unreachable => "unreachable",
            Opcode::CleanupRet => "cleanupret",
            Opcode::CatchRet => "catchret",
            Opcode::CatchSwitch => "catchswitch",
            Opcode::CallBr => "callbr",
            Opcode::FNeg => "fneg",
            Opcode::Add => "add",
            Opcode::FAdd => "fadd",
            Opcode::Sub => "sub",
            Opcode::FSub => "fsub",
            Opcode::Mul => "mul",
            Opcode::FMul => "fmul",
            Opcode::UDiv => "udiv",
            Opcode::SDiv => "sdiv",
            Opcode::FDiv => "fdiv",
            Opcode::URem => "urem",
            Opcode::SRem => "srem",
            Opcode::FRem => "frem",
            Opcode::Shl => "shl",
            Opcode::LShr => "lshr",
            Opcode::AShr => "ashr",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Alloca => "alloca",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::GetElementPtr => "getelementptr",
            Opcode::Fence => "fence",
            Opcode::AtomicCmpXchg => "cmpxchg",
            Opcode::AtomicRMW => "atomicrmw",
            Opcode::Trunc => "trunc",
            Opcode::ZExt => "zext",
            Opcode::SExt => "sext",
            Opcode::FPToUI => "fptoui",
            Opcode::FPToSI => "fptosi",
            Opcode::UIToFP => "uitofp",
            Opcode::SIToFP => "sitofp",
            Opcode::FPTrunc => "fptrunc",
            Opcode::FPExt => "fpext",
            Opcode::PtrToInt => "ptrtoint",
            Opcode::IntToPtr => "inttoptr",
            Opcode::BitCast => "bitcast",
            Opcode::AddrSpaceCast => "addrspacecast",
            Opcode::ICmp => "icmp",
            Opcode::FCmp => "fcmp",
            Opcode::Phi => "phi",
            Opcode::Call => "call",
            Opcode::Select => "select",
            Opcode::UserOp1 => "userop1",
            Opcode::UserOp2 => "userop2",
            Opcode::VAArg => "va_arg",
            Opcode::ExtractElement => "extractelement",
            Opcode::InsertElement => "insertelement",
            Opcode::ShuffleVector => "shufflevector",
            Opcode::ExtractValue => "extractvalue",
            Opcode::InsertValue => "insertvalue",
            Opcode::LandingPad => "landingpad",
            Opcode::CleanupPad => "cleanuppad",
            Opcode::CatchPad => "catchpad",
            Opcode::Freeze => "freeze",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Comparison predicate codes, numbered as the LLVM C API numbers them.
pub mod predicate {
    pub const FCMP_FALSE: u32 = 0;
    pub const FCMP_OEQ: u32 = 1;
    pub const FCMP_OGT: u32 = 2;
    pub const FCMP_OGE: u32 = 3;
    pub const FCMP_OLT: u32 = 4;
    pub const FCMP_OLE: u32 = 5;
    pub const FCMP_ONE: u32 = 6;
    pub const FCMP_ORD: u32 = 7;
    pub const FCMP_UNO: u32 = 8;
    pub const FCMP_UEQ: u32 = 9;
    pub const FCMP_UGT: u32 = 10;
    pub const FCMP_UGE: u32 = 11;
    pub const FCMP_ULT: u32 = 12;
    pub const FCMP_ULE: u32 = 13;
    pub const FCMP_UNE: u32 = 14;
    pub const FCMP_TRUE: u32 = 15;

    pub const ICMP_EQ: u32 = 32;
    pub const ICMP_NE: u32 = 33;
    pub const ICMP_UGT: u32 = 34;
    pub const ICMP_UGE: u32 = 35;
    pub const ICMP_ULT: u32 = 36;
    pub const ICMP_ULE: u32 = 37;
    pub const ICMP_SGT: u32 = 38;
    pub const ICMP_SGE: u32 = 39;
    pub const ICMP_SLT: u32 = 40;
    pub const ICMP_SLE: u32 = 41;
}
