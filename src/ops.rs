use num_enum::TryFromPrimitive;

/// Code value that terminates a v41 stream. Necessarily carried by an
/// `0xFF` extension, so it reaches the decoder as a full 32-bit code.
pub const END_CONTROL: u32 = 0xCDCD;

/// Control byte that widens the following code or immediate operand.
pub const EXT_CONTROL: u8 = 0xFF;

/// The v41 opcode table. One decoder instance commits to one table,
/// selected by the parsed version field; the numbering below is data, not
/// behaviour, so further tables can sit alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    FuncDecl = 0,
    CreateObject = 1,
    AddObject = 2,
    EndObject = 3,
    /// Jump if the float condition is not met.
    JmpIffNot = 4,
    /// Jump if the integer condition is not met.
    JmpIfNot = 5,
    /// Jump if the float condition is met.
    JmpIff = 6,
    /// Jump if the integer condition is met.
    JmpIf = 7,
    /// Short-circuit anchor for `&&`.
    JmpIfNotNp = 8,
    /// Short-circuit anchor for `||`.
    JmpIfNp = 9,
    Jmp = 10,
    Return = 11,
    CmpEq = 12,
    CmpGr = 13,
    CmpGe = 14,
    CmpLt = 15,
    CmpLe = 16,
    CmpNe = 17,
    Xor = 18,
    Mod = 19,
    BitAnd = 20,
    BitOr = 21,
    Not = 22,
    NotF = 23,
    OnesComplement = 24,
    Shr = 25,
    Shl = 26,
    And = 27,
    Or = 28,
    Add = 29,
    Sub = 30,
    Mul = 31,
    Div = 32,
    Neg = 33,
    SetCurVar = 34,
    SetCurVarCreate = 35,
    SetCurVarArray = 36,
    SetCurVarArrayCreate = 37,
    LoadVarUint = 38,
    LoadVarFlt = 39,
    LoadVarStr = 40,
    SaveVarUint = 41,
    SaveVarFlt = 42,
    SaveVarStr = 43,
    SetCurObject = 44,
    SetCurObjectNew = 45,
    SetCurObjectNewInt = 46,
    SetCurField = 47,
    SetCurFieldArray = 48,
    LoadFieldUint = 49,
    LoadFieldFlt = 50,
    LoadFieldStr = 51,
    SaveFieldUint = 52,
    SaveFieldFlt = 53,
    SaveFieldStr = 54,
    StrToUint = 55,
    StrToFlt = 56,
    StrToNone = 57,
    FltToUint = 58,
    FltToStr = 59,
    FltToNone = 60,
    UintToFlt = 61,
    UintToStr = 62,
    UintToNone = 63,
    LoadImmedUint = 64,
    LoadImmedFlt = 65,
    TagToStr = 66,
    LoadImmedStr = 67,
    /// Documentation comment payload; read and ignored on v41.
    DocBlockStr = 68,
    LoadImmedIdent = 69,
    CallFunc = 70,
    CallFuncResolve = 71,
    AdvanceStr = 72,
    AdvanceStrAppendChar = 73,
    AdvanceStrComma = 74,
    AdvanceStrNul = 75,
    RewindStr = 76,
    TerminateRewindStr = 77,
    CompareStr = 78,
    Push = 79,
    PushFrame = 80,
}

/// How a `CallFunc` target is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CallType {
    Function = 0,
    Method = 1,
    Parent = 2,
}
