//! # Stack API
//!
//! The low-level surface of the embedded Luau runtime consumed by the rest of
//! the crate: slot pushes and reads addressed by stack index, protected calls,
//! persistent references and opaque values carrying a destructor.
//!
//! A `Stack` is a copyable view over a `lua_State`. It is only constructed from
//! a state owned by a live `InstanceCtx`, or from the state handed to a native
//! callback, so every call in here goes through a valid pointer.

use std::ffi::CString;
use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_void;
use std::slice;

use mlua_sys as ffi;

use crate::builder::CompileOptions;

pub(crate) use mlua_sys::lua_State;

/// Native callback: receives the runtime state, returns the number of results pushed.
pub(crate) type NativeFn = unsafe extern "C-unwind" fn(*mut lua_State) -> c_int;

/// Fired by the collector when an opaque value is finalized.
pub(crate) type Destructor = unsafe extern "C-unwind" fn(*mut c_void);

pub(crate) const REGISTRY: c_int = ffi::LUA_REGISTRYINDEX;
pub(crate) const GLOBALS: c_int = ffi::LUA_GLOBALSINDEX;
pub(crate) const MULTRET: c_int = ffi::LUA_MULTRET;
pub(crate) const OK: c_int = ffi::LUA_OK;

/// Runtime type tag of a stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    None,
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Other,
}

impl Kind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Kind::None => "no value",
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Userdata => "userdata",
            Kind::Other => "other",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Stack {
    state: *mut lua_State,
}

impl Stack {
    /// # Safety
    /// `state` must point to an open runtime state for as long as the view is used.
    pub(crate) unsafe fn from_raw(state: *mut lua_State) -> Self {
        Self { state }
    }

    /// Allocates a fresh runtime state, optionally with the standard libraries.
    pub(crate) fn open(open_libs: bool) -> Option<Self> {
        let state = unsafe { ffi::luaL_newstate() };
        if state.is_null() {
            return None;
        }
        if open_libs {
            unsafe { ffi::luaL_openlibs(state) };
        }
        Some(Self { state })
    }

    /// # Safety
    /// Nothing may use this state (or any copy of this view) afterwards.
    pub(crate) unsafe fn close(self) {
        unsafe { ffi::lua_close(self.state) }
    }

    /// Runs a full collection cycle, finalizing every unreachable opaque value.
    pub(crate) fn collect_garbage(self) {
        unsafe {
            ffi::lua_gc(self.state, ffi::LUA_GCCOLLECT, 0);
        }
    }

    pub(crate) fn top(self) -> c_int {
        unsafe { ffi::lua_gettop(self.state) }
    }

    pub(crate) fn set_top(self, index: c_int) {
        unsafe { ffi::lua_settop(self.state, index) }
    }

    pub(crate) fn pop(self, n: c_int) {
        unsafe { ffi::lua_pop(self.state, n) }
    }

    pub(crate) fn reserve(self, extra: c_int) -> bool {
        unsafe { ffi::lua_checkstack(self.state, extra) != 0 }
    }

    pub(crate) fn kind(self, index: c_int) -> Kind {
        match unsafe { ffi::lua_type(self.state, index) } {
            ffi::LUA_TNONE => Kind::None,
            ffi::LUA_TNIL => Kind::Nil,
            ffi::LUA_TBOOLEAN => Kind::Boolean,
            ffi::LUA_TNUMBER => Kind::Number,
            ffi::LUA_TSTRING => Kind::String,
            ffi::LUA_TTABLE => Kind::Table,
            ffi::LUA_TFUNCTION => Kind::Function,
            ffi::LUA_TUSERDATA => Kind::Userdata,
            _ => Kind::Other,
        }
    }

    pub(crate) fn push_nil(self) {
        unsafe { ffi::lua_pushnil(self.state) }
    }

    pub(crate) fn push_boolean(self, value: bool) {
        unsafe { ffi::lua_pushboolean(self.state, value as c_int) }
    }

    pub(crate) fn push_number(self, value: f64) {
        unsafe { ffi::lua_pushnumber(self.state, value) }
    }

    pub(crate) fn push_string(self, value: &str) {
        unsafe {
            ffi::lua_pushlstring(self.state, value.as_ptr() as *const c_char, value.len());
        }
    }

    pub(crate) fn push_function(self, function: NativeFn) {
        unsafe { ffi::lua_pushcfunction(self.state, function) }
    }

    pub(crate) fn push_pointer(self, pointer: *mut c_void) {
        unsafe { ffi::lua_pushlightuserdata(self.state, pointer) }
    }

    pub(crate) fn new_table(self) {
        unsafe { ffi::lua_createtable(self.state, 0, 0) }
    }

    pub(crate) fn to_boolean(self, index: c_int) -> bool {
        unsafe { ffi::lua_toboolean(self.state, index) != 0 }
    }

    pub(crate) fn to_number(self, index: c_int) -> f64 {
        unsafe { ffi::lua_tonumber(self.state, index) }
    }

    /// Reads a string slot. Numbers are left alone so the slot keeps its kind.
    pub(crate) fn to_string_lossy(self, index: c_int) -> Option<String> {
        if self.kind(index) != Kind::String {
            return None;
        }
        let mut len = 0usize;
        let data = unsafe { ffi::lua_tolstring(self.state, index, &mut len) };
        if data.is_null() {
            return None;
        }
        let bytes = unsafe { slice::from_raw_parts(data as *const u8, len) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub(crate) fn to_pointer(self, index: c_int) -> *mut c_void {
        unsafe { ffi::lua_touserdata(self.state, index) }
    }

    /// Byte size of a userdata slot. Values allocated by `new_opaque` report
    /// the destructor slot on top of the requested size.
    pub(crate) fn opaque_len(self, index: c_int) -> usize {
        unsafe { ffi::lua_objlen(self.state, index) as usize }
    }

    /// Allocates an opaque value of `size` bytes and leaves it on top of the stack.
    pub(crate) fn new_opaque(self, size: usize, destructor: Destructor) -> *mut c_void {
        unsafe { ffi::lua_newuserdatadtor(self.state, size, destructor) }
    }

    /// Pops a table and installs it as the metatable of the value at `index`.
    pub(crate) fn set_metatable(self, index: c_int) {
        unsafe {
            ffi::lua_setmetatable(self.state, index);
        }
    }

    /// Converts a relative index to an absolute one; pseudo-indices are left alone.
    pub(crate) fn absolute(self, index: c_int) -> c_int {
        if index < 0 && index > REGISTRY { self.top() + index + 1 } else { index }
    }

    /// Pushes `table[name]` for the table at `index`, bypassing metamethods.
    pub(crate) fn get_field(self, index: c_int, name: &str) -> Kind {
        let table = self.absolute(index);
        self.push_string(name);
        unsafe { ffi::lua_rawget(self.state, table) };
        self.kind(-1)
    }

    /// Pops the top value into `table[name]` for the table at `index`, bypassing metamethods.
    pub(crate) fn set_field(self, index: c_int, name: &str) {
        let table = self.absolute(index);
        self.push_string(name);
        unsafe {
            ffi::lua_insert(self.state, -2);
            ffi::lua_rawset(self.state, table);
        }
    }

    pub(crate) fn get_global(self, name: &str) -> Kind {
        self.get_field(GLOBALS, name)
    }

    pub(crate) fn set_global(self, name: &str) {
        self.set_field(GLOBALS, name)
    }

    /// Pins the value at `index` in the registry. The value stays on the stack.
    pub(crate) fn create_reference(self, index: c_int) -> c_int {
        unsafe { ffi::lua_ref(self.state, index) }
    }

    pub(crate) fn release_reference(self, id: c_int) {
        unsafe { ffi::lua_unref(self.state, id) }
    }

    pub(crate) fn push_reference(self, id: c_int) -> Kind {
        unsafe { ffi::lua_rawgeti(self.state, REGISTRY, id as _) };
        self.kind(-1)
    }

    pub(crate) fn protected_call(self, nargs: c_int, nresults: c_int) -> c_int {
        unsafe { ffi::lua_pcall(self.state, nargs, nresults, 0) }
    }

    /// Raises the value on top of the stack as a script error. Never returns.
    ///
    /// # Safety
    /// Must only be called from inside a native callback, with no live Rust
    /// values left in the calling frame that need dropping.
    pub(crate) unsafe fn raise_error(self) -> ! {
        unsafe { ffi::lua_error(self.state) }
    }

    /// Loads compiled bytecode as a function on top of the stack.
    pub(crate) fn load(self, chunk_name: &str, bytecode: &[u8]) -> c_int {
        let name = key(chunk_name);
        unsafe {
            ffi::luau_load(
                self.state,
                name.as_ptr(),
                bytecode.as_ptr() as *const c_char,
                bytecode.len(),
                0,
            )
        }
    }

    /// Describes the error value on top of the stack.
    pub(crate) fn error_message(self) -> String {
        match self.kind(-1) {
            Kind::String => self.to_string_lossy(-1).unwrap_or_default(),
            Kind::Number => format!("{}", self.to_number(-1)),
            other => format!("(error object is a {} value)", other.name()),
        }
    }
}

/// Compiles source text to bytecode. The compiler reports errors in-band as a
/// bytecode blob whose first byte is zero followed by the message.
pub(crate) fn compile(source: &str, options: &CompileOptions) -> Result<Vec<u8>, String> {
    let mut raw = ffi::lua_CompileOptions::default();
    raw.optimizationLevel = options.optimization_level as c_int;
    raw.debugLevel = options.debug_level as c_int;
    raw.typeInfoLevel = options.type_info_level as c_int;
    raw.coverageLevel = options.coverage_level as c_int;
    let bytecode = unsafe { ffi::luau_compile(source.as_bytes(), raw) };
    match bytecode.split_first() {
        Some((0, message)) => Err(String::from_utf8_lossy(message).trim().to_string()),
        Some(_) => Ok(bytecode),
        None => Err("compiler produced no output".to_string()),
    }
}

fn key(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}
