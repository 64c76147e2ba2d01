//! The FTN mail subsystem: addressing, packet codec, arcmail, tossing,
//! scanning/packing, AreaFix, TIC file echoes, BinkP sessions, and the
//! nodelist index. [`mailer::Mailer`] owns the event loop that ties the
//! pieces together.

pub mod addr;
pub mod arcmail;
pub mod binkp;
pub mod echofix;
pub mod mailer;
pub mod nodelist;
pub mod outbound;
pub mod packet;
pub mod scanner;
pub mod tic;
pub mod tosser;
