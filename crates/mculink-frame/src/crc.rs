/// CRC16-CCITT as computed by the firmware (reflected, seeded 0xFFFF).
///
/// The intermediate is 8 bits wide: `data << 4` drops the high
/// nibble exactly as the firmware's `uint8_t` arithmetic does.
pub fn crc16_ccitt(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in buf {
        let mut data = byte ^ (crc & 0xff) as u8;
        data ^= data << 4;
        let data = u16::from(data);
        crc = ((data << 8) | (crc >> 8)) ^ (data >> 4) ^ (data << 3);
    }
    crc
}
