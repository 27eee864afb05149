/// 6-bit application key identifier carried in the AKF/AID header byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApplicationKeyIdentifier(u8);

impl From<u8> for ApplicationKeyIdentifier {
    fn from(val: u8) -> Self {
        Self(val & 0b00111111)
    }
}

impl From<ApplicationKeyIdentifier> for u8 {
    fn from(val: ApplicationKeyIdentifier) -> Self {
        val.0
    }
}
