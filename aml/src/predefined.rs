use crate::{
    namespace::NameSeg,
    object::{parse_hex_prefix, Object, ObjectType, WrappedObject},
    AmlError,
};
use alloc::{string::String, vec::Vec};
use log::warn;

/// The types a predefined name may return.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ReturnTypes(u8);

impl ReturnTypes {
    const INTEGER: ReturnTypes = ReturnTypes(1 << 0);
    const STRING: ReturnTypes = ReturnTypes(1 << 1);
    const BUFFER: ReturnTypes = ReturnTypes(1 << 2);
    const PACKAGE: ReturnTypes = ReturnTypes(1 << 3);
    const REFERENCE: ReturnTypes = ReturnTypes(1 << 4);
    const NONE: ReturnTypes = ReturnTypes(0);
    const ANY: ReturnTypes = ReturnTypes(0xff);

    const fn or(self, other: ReturnTypes) -> ReturnTypes {
        ReturnTypes(self.0 | other.0)
    }

    fn allows(&self, typ: ObjectType) -> bool {
        let bit = match typ {
            ObjectType::Integer => ReturnTypes::INTEGER,
            ObjectType::String => ReturnTypes::STRING,
            ObjectType::Buffer => ReturnTypes::BUFFER,
            ObjectType::Package => ReturnTypes::PACKAGE,
            ObjectType::Reference => ReturnTypes::REFERENCE,
            _ => return self.0 == 0xff,
        };
        self.0 & bit.0 != 0
    }
}

pub(crate) struct PredefinedName {
    pub name: &'static [u8; 4],
    pub arg_count: usize,
    pub returns: ReturnTypes,
    /// Packages returned by this name must have at least this many elements.
    pub min_elements: usize,
}

const fn predefined(name: &'static [u8; 4], arg_count: usize, returns: ReturnTypes) -> PredefinedName {
    PredefinedName { name, arg_count, returns, min_elements: 0 }
}

const fn package(name: &'static [u8; 4], arg_count: usize, min_elements: usize) -> PredefinedName {
    PredefinedName { name, arg_count, returns: ReturnTypes::PACKAGE, min_elements }
}

const INT: ReturnTypes = ReturnTypes::INTEGER;
const STR: ReturnTypes = ReturnTypes::STRING;
const BUF: ReturnTypes = ReturnTypes::BUFFER;
const PKG: ReturnTypes = ReturnTypes::PACKAGE;

const PREDEFINED_NAMES: &[PredefinedName] = &[
    predefined(b"_ADR", 0, INT),
    predefined(b"_BBN", 0, INT),
    predefined(b"_CCA", 0, INT),
    predefined(b"_CID", 0, INT.or(STR).or(PKG)),
    predefined(b"_CLS", 0, PKG),
    predefined(b"_CRS", 0, BUF),
    predefined(b"_CRT", 0, INT),
    predefined(b"_DDN", 0, STR),
    predefined(b"_DIS", 0, ReturnTypes::NONE),
    predefined(b"_DSM", 4, ReturnTypes::ANY),
    predefined(b"_DSW", 3, ReturnTypes::NONE),
    predefined(b"_EJD", 0, STR),
    predefined(b"_HID", 0, INT.or(STR)),
    predefined(b"_HRV", 0, INT),
    predefined(b"_INI", 0, ReturnTypes::NONE),
    predefined(b"_MAT", 0, BUF),
    predefined(b"_OSC", 4, BUF),
    predefined(b"_OST", 3, ReturnTypes::NONE),
    predefined(b"_PIC", 1, ReturnTypes::NONE),
    predefined(b"_PRS", 0, BUF),
    predefined(b"_PS0", 0, ReturnTypes::NONE),
    predefined(b"_PS3", 0, ReturnTypes::NONE),
    predefined(b"_PSC", 0, INT),
    predefined(b"_PSV", 0, INT),
    predefined(b"_PXM", 0, INT),
    predefined(b"_REG", 2, ReturnTypes::NONE),
    predefined(b"_RMV", 0, INT),
    predefined(b"_SEG", 0, INT),
    predefined(b"_SRS", 1, ReturnTypes::NONE),
    predefined(b"_STA", 0, INT),
    predefined(b"_STR", 0, BUF),
    predefined(b"_SUN", 0, INT),
    predefined(b"_TMP", 0, INT),
    predefined(b"_UID", 0, INT.or(STR)),
    package(b"_PR0", 0, 1),
    package(b"_PR3", 0, 1),
    package(b"_PRT", 0, 0),
    package(b"_PRW", 0, 2),
    package(b"_S0_", 0, 1),
    package(b"_S1_", 0, 1),
    package(b"_S2_", 0, 1),
    package(b"_S3_", 0, 1),
    package(b"_S4_", 0, 1),
    package(b"_S5_", 0, 1),
];

pub(crate) fn lookup(name: NameSeg) -> Option<&'static PredefinedName> {
    PREDEFINED_NAMES.iter().find(|predefined| *predefined.name == name.as_bytes())
}

/// Check the value returned by a predefined name, and repair the common mistakes firmware makes: returning an
/// integer as a string (or vice versa), returning a single object where a package is expected, returning a
/// package with too few elements, or returning a lowercase `_HID`.
pub(crate) fn validate_and_repair(
    name: NameSeg,
    value: WrappedObject,
    integer_bytes: usize,
) -> Result<WrappedObject, AmlError> {
    let Some(predefined) = lookup(name) else { return Ok(value) };
    if predefined.returns == ReturnTypes::ANY {
        return Ok(value);
    }
    if predefined.returns == ReturnTypes::NONE {
        return Ok(value);
    }

    let typ = value.lock().typ();
    let value = if predefined.returns.allows(typ) {
        value
    } else {
        let repaired = repair_type(predefined, &value.snapshot(), integer_bytes).ok_or_else(|| {
            warn!("{} returned an object of type {:?}, which can't be repaired", name.as_str(), typ);
            AmlError::ObjectNotOfExpectedType { expected: expected_type(predefined.returns), got: typ }
        })?;
        warn!("Repaired return value of {} from {:?} to {:?}", name.as_str(), typ, repaired.typ());
        repaired.wrap()
    };

    if &name.as_bytes() == b"_HID" {
        let mut object = value.lock();
        if let Object::String(hid) = &mut *object {
            if hid.chars().any(|c| c.is_ascii_lowercase()) {
                warn!("Repaired lowercase _HID {:?}", hid);
                *hid = hid.to_ascii_uppercase();
            }
        }
    }

    if predefined.min_elements > 0 {
        let mut object = value.lock();
        if let Object::Package(elements) = &mut *object {
            if elements.len() < predefined.min_elements {
                warn!(
                    "{} returned a package of {} elements (expected at least {}); padding with zeros",
                    name.as_str(),
                    elements.len(),
                    predefined.min_elements
                );
                while elements.len() < predefined.min_elements {
                    elements.push(Object::Integer(0).wrap());
                }
            }
        }
    }

    Ok(value)
}

fn expected_type(returns: ReturnTypes) -> ObjectType {
    if returns.allows(ObjectType::Integer) {
        ObjectType::Integer
    } else if returns.allows(ObjectType::String) {
        ObjectType::String
    } else if returns.allows(ObjectType::Buffer) {
        ObjectType::Buffer
    } else {
        ObjectType::Package
    }
}

fn repair_type(predefined: &PredefinedName, value: &Object, integer_bytes: usize) -> Option<Object> {
    let returns = predefined.returns;
    match value {
        Object::String(string) if returns.allows(ObjectType::Integer) => {
            Some(Object::Integer(parse_hex_prefix(string, integer_bytes)))
        }
        Object::Buffer(bytes) if returns.allows(ObjectType::Integer) && bytes.len() <= integer_bytes => {
            value.to_integer(integer_bytes).ok().map(Object::Integer)
        }
        Object::Integer(_) if returns.allows(ObjectType::String) => {
            value.to_aml_string(integer_bytes).ok().map(Object::String)
        }
        Object::Buffer(bytes) if returns.allows(ObjectType::String) => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            let string: String = bytes[..end].iter().map(|&b| b as char).collect();
            Some(Object::String(string))
        }
        Object::Integer(_) | Object::String(_) if returns.allows(ObjectType::Buffer) => {
            value.to_buffer(integer_bytes).ok().map(Object::Buffer)
        }
        other if returns.allows(ObjectType::Package) && other.is_data() => {
            let mut elements: Vec<WrappedObject> = Vec::new();
            elements.push(other.clone().wrap());
            Some(Object::Package(elements))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn seg(name: &str) -> NameSeg {
        NameSeg::from_str(name).unwrap()
    }

    #[test]
    fn values_of_the_right_type_pass_through() {
        let value = Object::Integer(0xf).wrap();
        let checked = validate_and_repair(seg("_STA"), value.clone(), 8).unwrap();
        assert!(checked.ptr_eq(&value));

        // Names we don't know about are never touched
        let value = Object::String("hello".to_string()).wrap();
        assert!(validate_and_repair(seg("FOO_"), value.clone(), 8).unwrap().ptr_eq(&value));
    }

    #[test]
    fn repairs() {
        let sta = validate_and_repair(seg("_STA"), Object::String("0x0F".to_string()).wrap(), 8).unwrap();
        assert_eq!(sta.lock().as_integer(), Ok(0x0f));

        let ddn = validate_and_repair(seg("_DDN"), Object::Integer(0x1234).wrap(), 4).unwrap();
        assert_eq!(ddn.lock().as_string(), Ok("00001234"));

        let hid = validate_and_repair(seg("_HID"), Object::String("pnp0a03".to_string()).wrap(), 8).unwrap();
        assert_eq!(hid.lock().as_string(), Ok("PNP0A03"));

        let prw = validate_and_repair(seg("_PRW"), Object::Integer(0x6d).wrap(), 8).unwrap();
        let Object::Package(elements) = prw.snapshot() else { panic!() };
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].lock().as_integer(), Ok(0x6d));
        assert_eq!(elements[1].lock().as_integer(), Ok(0));

        assert!(validate_and_repair(seg("_CRS"), Object::Device.wrap(), 8).is_err());
    }
}
