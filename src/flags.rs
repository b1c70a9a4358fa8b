use bitflags::bitflags;
use picky_asn1::bit_string::BitString;
use picky_krb::data_types::KerberosFlags;

bitflags! {
    /// Flags the client asks the KDC to set on the issued ticket. Carried in the
    /// kdc-options field of KRB_AS_REQ and KRB_TGS_REQ.
    ///
    /// [KDCOptions](https://www.rfc-editor.org/rfc/rfc4120#section-5.4.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct KdcOptions: u32 {
        const FORWARDABLE = 0x40000000;
        const FORWARDED = 0x20000000;
        const PROXIABLE = 0x10000000;
        const PROXY = 0x08000000;
        const ALLOW_POSTDATE = 0x04000000;
        const POSTDATED = 0x02000000;
        const RENEWABLE = 0x00800000;
        const OPT_HARDWARE_AUTH = 0x00100000;
        const CANONICALIZE = 0x00010000;
        const DISABLE_TRANSITED_CHECK = 0x00000020;
        const RENEWABLE_OK = 0x00000010;
        const ENC_TKT_IN_SKEY = 0x00000008;
        const RENEW = 0x00000002;
        const VALIDATE = 0x00000001;
    }
}

bitflags! {
    /// Flags recorded inside the encrypted part of a ticket. The KDC sets them
    /// when it issues the ticket and application servers read them back.
    ///
    /// [TicketFlags](https://www.rfc-editor.org/rfc/rfc4120#section-5.3)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TicketFlags: u32 {
        const FORWARDABLE = 0x40000000;
        const FORWARDED = 0x20000000;
        const PROXIABLE = 0x10000000;
        const PROXY = 0x08000000;
        const MAY_POSTDATE = 0x04000000;
        const POSTDATED = 0x02000000;
        const INVALID = 0x01000000;
        const RENEWABLE = 0x00800000;
        const INITIAL = 0x00400000;
        const PRE_AUTHENT = 0x00200000;
        const HW_AUTHENT = 0x00100000;
        const TRANSITED_POLICY_CHECKED = 0x00080000;
        const OK_AS_DELEGATE = 0x00040000;
    }
}

bitflags! {
    /// Flags in the application request (KRB_AP_REQ) that affect how the
    /// acceptor processes it.
    ///
    /// [APOptions](https://www.rfc-editor.org/rfc/rfc4120#section-5.5.1)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ApOptions: u32 {
        const USE_SESSION_KEY = 0x40000000;
        const MUTUAL_REQUIRED = 0x20000000;
    }
}

bitflags! {
    /// PA-PAC-OPTIONS flags (MS-SFU 2.2.5 / MS-KILE 2.2.10).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct PacOptions: u32 {
        const CLAIMS = 0x80000000;
        const BRANCH_AWARE = 0x40000000;
        const FORWARD_TO_FULL_DC = 0x20000000;
        const RESOURCE_BASED_CONSTRAINED_DELEGATION = 0x10000000;
    }
}

/// Encodes a 32-bit flag word as the ASN.1 BIT STRING Kerberos uses on the wire.
pub(crate) fn encode_flags(bits: u32) -> KerberosFlags {
    KerberosFlags::from(BitString::with_bytes(bits.to_be_bytes().to_vec()))
}

/// Reads a flag word back from a wire BIT STRING. Short payloads are
/// zero-extended so truncated encodings decode to the bits that were present.
pub(crate) fn decode_flags(flags: &KerberosFlags) -> u32 {
    let mut raw = [0u8; 4];
    for (dst, src) in raw.iter_mut().zip(flags.payload_view()) {
        *dst = *src;
    }
    u32::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_survive_wire_encoding() {
        let options = KdcOptions::FORWARDABLE | KdcOptions::RENEWABLE | KdcOptions::RENEWABLE_OK;

        let decoded = decode_flags(&encode_flags(options.bits()));

        assert_eq!(decoded, options.bits());
        assert!(KdcOptions::from_bits_truncate(decoded).contains(KdcOptions::RENEWABLE));
    }

    #[test]
    fn short_bit_string_is_zero_extended() {
        let flags = KerberosFlags::from(BitString::with_bytes(vec![0x40]));

        assert_eq!(decode_flags(&flags), 0x40000000);
    }

    #[test]
    fn ticket_and_kdc_flag_positions_line_up() {
        assert_eq!(TicketFlags::FORWARDABLE.bits(), KdcOptions::FORWARDABLE.bits());
        assert_eq!(TicketFlags::PROXIABLE.bits(), KdcOptions::PROXIABLE.bits());
        assert_eq!(TicketFlags::RENEWABLE.bits(), KdcOptions::RENEWABLE.bits());
    }
}
