//! LibXML2 FFI Wrapper Module
//!
//! Safe wrapper around the libxml2 calls needed for W3C XML Schema validation.
//!
//! There is no mature pure Rust XSD validator, so schema compilation and validation are done by
//! libxml2 through direct FFI. Event parsing of instance documents is done in Rust
//! (`quick-xml`); libxml2 only ever sees complete, re-serialized subtrees.
//!
//! ## Thread Safety Strategy
//!
//! * **Initialization**: `xmlInitParser` runs exactly once behind [`std::sync::Once`].
//! * **Schema parsing**: NOT thread-safe in libxml2. Every parse holds [`SCHEMA_PARSE_LOCK`].
//! * **Validation**: thread-safe for different documents. Each call creates its own document
//!   and validation context, so any number of threads may validate against one shared schema.
//! * **Schema sharing**: parsed schemas are read-only and shared through [`XmlSchemaPtr`].

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::sync::{Arc, Once};

use libc::{c_char, c_int, c_void};
use parking_lot::Mutex;

use crate::error::{LibXml2Error, LibXml2Result};

static LIBXML2_INIT: Once = Once::new();

/// Serializes libxml2 schema parsing across the process.
static SCHEMA_PARSE_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// `XML_PARSE_NOERROR | XML_PARSE_NOWARNING | XML_PARSE_NONET`
const DOCUMENT_PARSE_OPTIONS: c_int = 32 | 64 | 2048;

/// `XML_ERR_WARNING`
const XML_ERR_WARNING: c_int = 1;

// Opaque libxml2 structures
#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub fn xmlInitParser();

    // Schema parsing
    pub fn xmlSchemaNewParserCtxt(url: *const c_char) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaNewMemParserCtxt(
        buffer: *const c_char,
        size: c_int,
    ) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    // Documents
    pub fn xmlReadMemory(
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);

    // Schema validation
    pub fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaValidateDoc(ctxt: *mut XmlSchemaValidCtxt, doc: *mut XmlDoc) -> c_int;
}

/// One error or warning reported by libxml2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredError {
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub column: Option<u64>,
    pub warning: bool,
}

unsafe fn optional_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

/// Collects libxml2's structured errors into the `Vec<StructuredError>` behind `user_data`.
unsafe extern "C" fn structured_error_callback(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() || error.is_null() {
        return;
    }
    let errors = unsafe { &mut *(user_data as *mut Vec<StructuredError>) };
    let error = unsafe { &*error };
    let message = unsafe { optional_string(error.message) }
        .map(|m| m.trim().to_string())
        .unwrap_or_else(|| format!("libxml2 error {}", error.code));
    errors.push(StructuredError {
        message,
        file: unsafe { optional_string(error.file) },
        line: u64::try_from(error.line).ok().filter(|l| *l > 0),
        column: u64::try_from(error.int2).ok().filter(|c| *c > 0),
        warning: error.level == XML_ERR_WARNING,
    });
}

/// Shared handle to a parsed libxml2 schema, freed when the last clone drops.
#[derive(Debug, Clone)]
pub struct XmlSchemaPtr {
    inner: Arc<XmlSchemaInner>,
}

#[derive(Debug)]
struct XmlSchemaInner {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: libxml2 schemas are read-only after parsing and may be used for validation from
// several threads at once (http://xmlsoft.org/threads.html).
unsafe impl Send for XmlSchemaInner {}
unsafe impl Sync for XmlSchemaInner {}

impl XmlSchemaPtr {
    /// # Safety
    ///
    /// `ptr` must be null or a schema returned by `xmlSchemaParse` that nothing else frees.
    unsafe fn from_raw(ptr: *mut XmlSchema, url: &str) -> LibXml2Result<Self> {
        if ptr.is_null() {
            return Err(LibXml2Error::SchemaParseFailed {
                url: url.to_string(),
            });
        }
        Ok(XmlSchemaPtr {
            inner: Arc::new(XmlSchemaInner {
                ptr,
                _phantom: PhantomData,
            }),
        })
    }

    fn as_ptr(&self) -> *const XmlSchema {
        self.inner.ptr
    }
}

impl Drop for XmlSchemaInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xmlSchemaFree(self.ptr);
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// Validation result from libxml2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// Return code 0
    Valid,
    /// Return code > 0
    Invalid {
        error_count: i32,
        errors: Vec<StructuredError>,
    },
    /// Return code < 0
    InternalError { code: i32 },
}

impl ValidationResult {
    pub fn from_code(code: c_int, errors: Vec<StructuredError>) -> Self {
        match code {
            0 => ValidationResult::Valid,
            n if n > 0 => ValidationResult::Invalid {
                error_count: n,
                errors,
            },
            n => ValidationResult::InternalError { code: n },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationResult::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationResult::InternalError { .. })
    }
}

/// Entry point for libxml2 schema parsing and validation.
pub struct LibXml2Wrapper {
    _phantom: PhantomData<()>,
}

impl LibXml2Wrapper {
    /// Initializes libxml2 on first use; later calls are free.
    pub fn new() -> Self {
        LIBXML2_INIT.call_once(|| unsafe {
            xmlInitParser();
        });
        LibXml2Wrapper {
            _phantom: PhantomData,
        }
    }

    /// Parses the schema document at `url`, resolving its imports and includes relative to it.
    ///
    /// Every error and warning libxml2 reports is appended to `errors`, whether or not the
    /// parse succeeds.
    pub fn parse_schema_from_url(
        &self,
        url: &str,
        errors: &mut Vec<StructuredError>,
    ) -> LibXml2Result<XmlSchemaPtr> {
        let c_url = CString::new(url).map_err(|_| LibXml2Error::InvalidXml {
            details: format!("schema URL contains a NUL byte: {}", url),
        })?;
        let _guard = SCHEMA_PARSE_LOCK.lock();
        unsafe {
            let parser_ctxt = xmlSchemaNewParserCtxt(c_url.as_ptr());
            Self::parse_with(parser_ctxt, url, errors)
        }
    }

    /// Parses a schema held in memory. Relative references inside it cannot be resolved.
    pub fn parse_schema_from_memory(
        &self,
        schema_data: &[u8],
        errors: &mut Vec<StructuredError>,
    ) -> LibXml2Result<XmlSchemaPtr> {
        let size = c_int::try_from(schema_data.len()).map_err(|_| LibXml2Error::MemoryAllocation)?;
        let _guard = SCHEMA_PARSE_LOCK.lock();
        unsafe {
            let parser_ctxt =
                xmlSchemaNewMemParserCtxt(schema_data.as_ptr() as *const c_char, size);
            Self::parse_with(parser_ctxt, "<memory>", errors)
        }
    }

    /// # Safety
    ///
    /// Must be called with [`SCHEMA_PARSE_LOCK`] held; takes ownership of `parser_ctxt`.
    unsafe fn parse_with(
        parser_ctxt: *mut XmlSchemaParserCtxt,
        url: &str,
        errors: &mut Vec<StructuredError>,
    ) -> LibXml2Result<XmlSchemaPtr> {
        if parser_ctxt.is_null() {
            return Err(LibXml2Error::MemoryAllocation);
        }
        unsafe {
            xmlSchemaSetParserStructuredErrors(
                parser_ctxt,
                Some(structured_error_callback),
                errors as *mut Vec<StructuredError> as *mut c_void,
            );
            let schema_ptr = xmlSchemaParse(parser_ctxt);
            xmlSchemaFreeParserCtxt(parser_ctxt);
            XmlSchemaPtr::from_raw(schema_ptr, url)
        }
    }

    /// Parses `content` and validates it against `schema`.
    ///
    /// Thread-safe: the document and validation context are private to this call. `url` is
    /// only used in libxml2's messages.
    pub fn validate_memory(
        &self,
        schema: &XmlSchemaPtr,
        content: &[u8],
        url: Option<&str>,
    ) -> LibXml2Result<ValidationResult> {
        let size = c_int::try_from(content.len()).map_err(|_| LibXml2Error::MemoryAllocation)?;
        let c_url = url
            .map(CString::new)
            .transpose()
            .map_err(|_| LibXml2Error::InvalidXml {
                details: "document URL contains a NUL byte".to_string(),
            })?;
        let url_ptr = c_url.as_ref().map_or(std::ptr::null(), |u| u.as_ptr());

        unsafe {
            let doc = xmlReadMemory(
                content.as_ptr() as *const c_char,
                size,
                url_ptr,
                std::ptr::null(),
                DOCUMENT_PARSE_OPTIONS,
            );
            if doc.is_null() {
                return Err(LibXml2Error::InvalidXml {
                    details: format!("libxml2 could not parse {}", url.unwrap_or("<memory>")),
                });
            }

            let valid_ctxt = xmlSchemaNewValidCtxt(schema.as_ptr());
            if valid_ctxt.is_null() {
                xmlFreeDoc(doc);
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }

            let mut errors: Vec<StructuredError> = Vec::new();
            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(structured_error_callback),
                &mut errors as *mut Vec<StructuredError> as *mut c_void,
            );
            let result_code = xmlSchemaValidateDoc(valid_ctxt, doc);

            xmlSchemaFreeValidCtxt(valid_ctxt);
            xmlFreeDoc(doc);

            match ValidationResult::from_code(result_code, errors) {
                ValidationResult::InternalError { code } => {
                    Err(LibXml2Error::InternalError { code })
                }
                result => Ok(result),
            }
        }
    }
}

impl Default for LibXml2Wrapper {
    fn default() -> Self {
        Self::new()
    }
}
